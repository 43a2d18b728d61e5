//! NSQ broker controller.
//!
//! Identifiers are `topic` or `topic#channel`. Publishing ignores the channel.
//! Subscribing binds a consumer to the channel, or to `"default"` when none
//! is given.
//!
//! Consumers reach nsqd either directly or through nsqlookupd
//! ([`ConnectStrategy`]). The controller address is used for both connect
//! strategies and for topic discovery (`GET http://{address}/topics`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};

use crate::broker::{
    wait_for_cancellation_async, BrokerChannelSubscription, BrokerController, BrokerMessage,
    Result, BROKER_MESSAGES_QUEUE_SIZE,
};

pub mod address;
pub mod client;
pub mod handler;
pub mod lookup;
pub mod mock;
#[cfg(feature = "nsq")]
pub mod tokio_nsq;

pub use address::{publish_topic, TopicChannel, CHANNEL_DELIMITER, DEFAULT_CHANNEL_NAME};
pub use client::{MessageHandler, NsqClientFactory, NsqConsumer, NsqMessage, NsqProducer};
pub use handler::{to_broker_message, ATTEMPTS_HEADER, MESSAGE_ID_HEADER, TIMESTAMP_HEADER};
pub use lookup::TopicLookupClient;
pub use mock::MockNsq;
#[cfg(feature = "nsq")]
pub use self::tokio_nsq::TokioNsqFactory;

use handler::ForwardingHandler;

/// How subscription consumers reach nsqd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStrategy {
    /// Connect straight to the nsqd at the controller address.
    #[default]
    Nsqd,
    /// Ask the nsqlookupd at the controller address which nsqd hosts the topic.
    Lookupd,
}

impl ConnectStrategy {
    /// Connect `consumer` to `addr`.
    pub async fn connect(self, consumer: &mut dyn NsqConsumer, addr: &str) -> Result<()> {
        match self {
            Self::Nsqd => consumer.connect_to_nsqd(addr).await,
            Self::Lookupd => consumer.connect_to_nsqlookupd(addr).await,
        }
    }
}

/// Construction options for [`NsqController`].
#[derive(Debug, Clone)]
pub struct NsqControllerConfig {
    /// Receives the controller's log events. `None` discards them.
    pub logger: Option<Dispatch>,
    /// Connect strategy applied to every subscription.
    pub connect: ConnectStrategy,
    /// Capacity of each subscription's message queue.
    pub queue_size: usize,
    /// Per-request timeout for topic lookup. `None` waits indefinitely.
    pub lookup_timeout: Option<Duration>,
}

impl Default for NsqControllerConfig {
    fn default() -> Self {
        Self {
            logger: None,
            connect: ConnectStrategy::Nsqd,
            queue_size: BROKER_MESSAGES_QUEUE_SIZE,
            lookup_timeout: None,
        }
    }
}

impl NsqControllerConfig {
    /// Send controller log events to `logger`.
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Connect subscriptions through nsqlookupd.
    pub fn with_lookupd_connect(self) -> Self {
        self.with_connect(ConnectStrategy::Lookupd)
    }

    /// Set the connect strategy.
    pub fn with_connect(mut self, connect: ConnectStrategy) -> Self {
        self.connect = connect;
        self
    }

    /// Set the subscription queue capacity.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Set the topic lookup timeout.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }
}

/// NSQ implementation of [`BrokerController`].
///
/// All fields are fixed at construction, so one instance can be shared
/// across tasks (`Arc<NsqController>`) without locking.
pub struct NsqController {
    addr: String,
    producer: Box<dyn NsqProducer>,
    factory: Arc<dyn NsqClientFactory>,
    lookup: TopicLookupClient,
    logger: Dispatch,
    connect: ConnectStrategy,
    queue_size: usize,
}

const _: fn() = || {
    fn assert_broker_controller<T: BrokerController>() {}
    assert_broker_controller::<NsqController>();
};

impl NsqController {
    /// Create a controller using the `tokio-nsq` client.
    #[cfg(feature = "nsq")]
    pub fn new(addr: impl Into<String>, config: NsqControllerConfig) -> Result<Self> {
        Self::with_factory(addr, Arc::new(TokioNsqFactory::new()), config)
    }

    /// Create a controller on top of any client backend.
    ///
    /// The producer is created immediately; consumers are created per
    /// subscription.
    pub fn with_factory(
        addr: impl Into<String>,
        factory: Arc<dyn NsqClientFactory>,
        config: NsqControllerConfig,
    ) -> Result<Self> {
        let addr = addr.into();
        let producer = factory.new_producer(&addr)?;
        let lookup = TopicLookupClient::new(&addr, config.lookup_timeout)?;
        let logger = config.logger.unwrap_or_else(Dispatch::none);
        let queue_size = config.queue_size.max(1);

        tracing::dispatcher::with_default(&logger, || {
            info!(
                address = %addr,
                connect = ?config.connect,
                queue_size,
                "NSQ controller created"
            );
        });

        Ok(Self {
            addr,
            producer,
            factory,
            lookup,
            logger,
            connect: config.connect,
            queue_size,
        })
    }

    /// Address used for producing, connecting consumers and topic lookup.
    pub fn address(&self) -> &str {
        &self.addr
    }

    pub fn connect_strategy(&self) -> ConnectStrategy {
        self.connect
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }
}

impl fmt::Debug for NsqController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NsqController")
            .field("addr", &self.addr)
            .field("connect", &self.connect)
            .field("queue_size", &self.queue_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerController for NsqController {
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()> {
        let topic = publish_topic(channel);

        async move {
            if !message.headers.is_empty() {
                debug!(
                    topic = %topic,
                    header_count = message.headers.len(),
                    "NSQ carries no headers, dropping them"
                );
            }

            self.producer.publish(topic, message.payload).await?;
            debug!(topic = %topic, "Published message");
            Ok(())
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerChannelSubscription> {
        let TopicChannel { topic, channel } = TopicChannel::parse(channel);

        async move {
            let mut consumer = self.factory.new_consumer(&topic, &channel)?;

            let (tx, rx) = mpsc::channel(self.queue_size);
            consumer.add_handler(Arc::new(ForwardingHandler::new(tx, self.logger.clone())));

            if let Err(e) = self.connect.connect(consumer.as_mut(), &self.addr).await {
                warn!(
                    topic = %topic,
                    channel = %channel,
                    address = %self.addr,
                    error = %e,
                    "Failed to connect consumer"
                );
                return Err(e);
            }

            let (subscription, cancelled) = BrokerChannelSubscription::new(rx);
            let logger = self.logger.clone();
            info!(topic = %topic, channel = %channel, connect = ?self.connect, "Subscribed");

            wait_for_cancellation_async(cancelled, move || {
                async move {
                    let mut consumer = consumer;
                    consumer.stop().await;
                    info!(topic = %topic, channel = %channel, "Subscription cancelled");
                }
                .with_subscriber(logger)
            });

            Ok(subscription)
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    async fn lookup_topics(&self) -> Result<Vec<String>> {
        self.lookup
            .lookup_topics()
            .with_subscriber(self.logger.clone())
            .await
    }

    async fn close(&self) {
        async {
            self.producer.stop().await;
            info!(address = %self.addr, "NSQ controller closed");
        }
        .with_subscriber(self.logger.clone())
        .await
    }
}

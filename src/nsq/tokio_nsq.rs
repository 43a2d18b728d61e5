//! NSQ client backed by the `tokio-nsq` crate.
//!
//! Requires a running tokio runtime: producers and consumers spawn their
//! connection tasks when they are built.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_nsq::{
    NSQChannel, NSQConsumer, NSQConsumerConfig, NSQConsumerConfigSources,
    NSQConsumerLookupConfig, NSQEvent, NSQMessage, NSQProducer, NSQProducerConfig, NSQTopic,
};
use tracing::{debug, info, warn};

use super::client::{MessageHandler, NsqClientFactory, NsqConsumer, NsqMessage, NsqProducer};
use crate::broker::{BrokerError, Result};

/// Default number of unacknowledged messages nsqd may push to one consumer.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 1;

/// Default bound on a connect handshake or a publish acknowledgement.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory for `tokio-nsq` producers and consumers.
#[derive(Debug, Clone)]
pub struct TokioNsqFactory {
    max_in_flight: u32,
    connect_timeout: Duration,
}

impl Default for TokioNsqFactory {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TokioNsqFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max in flight for every consumer created afterwards.
    pub fn with_max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Bound the wait for nsqd to accept a connection or acknowledge a PUB.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl NsqClientFactory for TokioNsqFactory {
    fn new_producer(&self, addr: &str) -> Result<Box<dyn NsqProducer>> {
        if addr.is_empty() {
            return Err(BrokerError::Construction(
                "nsqd address must not be empty".to_string(),
            ));
        }

        let producer = NSQProducerConfig::new(addr).build();
        info!(nsqd = %addr, "Created NSQ producer");

        Ok(Box::new(TokioNsqProducer {
            producer: Mutex::new(Some(producer)),
            ack_timeout: self.connect_timeout,
        }))
    }

    fn new_consumer(&self, topic: &str, channel: &str) -> Result<Box<dyn NsqConsumer>> {
        let topic_ref = NSQTopic::new(topic)
            .ok_or_else(|| BrokerError::Construction(format!("invalid topic name '{}'", topic)))?;
        let channel_ref = NSQChannel::new(channel).ok_or_else(|| {
            BrokerError::Construction(format!("invalid channel name '{}'", channel))
        })?;

        Ok(Box::new(TokioNsqConsumer {
            topic: topic_ref,
            channel: channel_ref,
            topic_name: topic.to_string(),
            channel_name: channel.to_string(),
            max_in_flight: self.max_in_flight,
            connect_timeout: self.connect_timeout,
            handlers: Vec::new(),
            dispatch: None,
        }))
    }
}

/// nsqlookupd addresses must carry a scheme for `tokio-nsq`.
fn lookupd_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Check that an nsqlookupd answers `GET /ping`.
async fn ping_lookupd(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BrokerError::Connect(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(format!("{}/ping", url))
        .send()
        .await
        .map_err(|e| BrokerError::Connect(format!("nsqlookupd {} unreachable: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(BrokerError::Connect(format!(
            "nsqlookupd {} answered ping with HTTP {}",
            url,
            response.status()
        )));
    }
    Ok(())
}

/// Wait for the first connection to finish its handshake.
///
/// A message arriving first also proves the connection and is returned so it
/// can be dispatched. `tokio-nsq` keeps retrying a refused connection without
/// reporting it, so the timeout is what catches an unreachable nsqd.
async fn await_healthy(
    consumer: &mut NSQConsumer,
    addr: &str,
    timeout: Duration,
) -> Result<Option<NSQMessage>> {
    let first = tokio::time::timeout(timeout, consumer.consume())
        .await
        .map_err(|_| {
            BrokerError::Connect(format!(
                "nsqd {} did not accept a connection within {:?}",
                addr, timeout
            ))
        })?;

    match first {
        Some(NSQEvent::Healthy()) => Ok(None),
        Some(NSQEvent::Message(message)) => Ok(Some(message)),
        Some(NSQEvent::Unhealthy()) => Err(BrokerError::Connect(format!(
            "connection to nsqd {} failed",
            addr
        ))),
        Some(NSQEvent::Ok()) | None => Err(BrokerError::Connect(format!(
            "nsqd {} closed the connection",
            addr
        ))),
    }
}

fn to_nsq_message(message: &NSQMessage) -> NsqMessage {
    NsqMessage {
        id: message.id.to_vec(),
        attempts: message.attempt,
        timestamp: message.timestamp as i64,
        body: message.body.clone(),
    }
}

struct TokioNsqProducer {
    // None once stopped.
    producer: Mutex<Option<NSQProducer>>,
    ack_timeout: Duration,
}

#[async_trait]
impl NsqProducer for TokioNsqProducer {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        let topic_ref = NSQTopic::new(topic)
            .ok_or_else(|| BrokerError::Publish(format!("invalid topic name '{}'", topic)))?;

        let mut guard = self.producer.lock().await;
        let producer = guard
            .as_mut()
            .ok_or_else(|| BrokerError::Publish("producer stopped".to_string()))?;

        producer
            .publish(&topic_ref, body)
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        // Wait for nsqd to acknowledge the PUB.
        let ack = async {
            loop {
                match producer.consume().await {
                    Some(NSQEvent::Ok()) => return Ok(()),
                    Some(NSQEvent::Healthy()) => continue,
                    Some(NSQEvent::Unhealthy()) => {
                        return Err(BrokerError::Publish(
                            "nsqd connection unhealthy".to_string(),
                        ))
                    }
                    Some(NSQEvent::Message(_)) => {
                        return Err(BrokerError::Publish(
                            "unexpected producer event".to_string(),
                        ))
                    }
                    None => return Err(BrokerError::Publish("producer closed".to_string())),
                }
            }
        };

        tokio::time::timeout(self.ack_timeout, ack)
            .await
            .map_err(|_| {
                BrokerError::Publish(format!(
                    "nsqd did not acknowledge within {:?}",
                    self.ack_timeout
                ))
            })??;

        debug!(topic = %topic, "Published message");
        Ok(())
    }

    async fn stop(&self) {
        if self.producer.lock().await.take().is_some() {
            info!("Stopped NSQ producer");
        }
    }
}

struct TokioNsqConsumer {
    topic: Arc<NSQTopic>,
    channel: Arc<NSQChannel>,
    topic_name: String,
    channel_name: String,
    max_in_flight: u32,
    connect_timeout: Duration,
    handlers: Vec<Arc<dyn MessageHandler>>,
    dispatch: Option<JoinHandle<()>>,
}

impl TokioNsqConsumer {
    fn check_connectable(&self) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(BrokerError::Connect(
                "no handlers added before connecting".to_string(),
            ));
        }
        if self.dispatch.is_some() {
            return Err(BrokerError::Connect("consumer already connected".to_string()));
        }
        Ok(())
    }

    fn build(&self, sources: NSQConsumerConfigSources) -> NSQConsumer {
        NSQConsumerConfig::new(self.topic.clone(), self.channel.clone())
            .set_max_in_flight(self.max_in_flight)
            .set_sources(sources)
            .build()
    }

    /// Hand the consumer to a task that runs every handler, then finishes.
    fn spawn_dispatch(&mut self, mut consumer: NSQConsumer, first: Option<NSQMessage>) {
        let handlers = self.handlers.clone();
        let topic = self.topic_name.clone();
        let channel = self.channel_name.clone();

        self.dispatch = Some(tokio::spawn(async move {
            let mut next = first;
            loop {
                let message = match next.take() {
                    Some(message) => message,
                    None => match consumer.consume_filtered().await {
                        Some(message) => message,
                        None => break,
                    },
                };

                let delivered = to_nsq_message(&message);
                for handler in &handlers {
                    if let Err(e) = handler.handle(delivered.clone()).await {
                        warn!(topic = %topic, channel = %channel, error = %e, "Handler failed");
                    }
                }

                message.finish().await;
            }
            debug!(topic = %topic, channel = %channel, "NSQ consumer stream ended");
        }));

        info!(
            topic = %self.topic_name,
            channel = %self.channel_name,
            "NSQ consumer connected"
        );
    }
}

#[async_trait]
impl NsqConsumer for TokioNsqConsumer {
    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    async fn connect_to_nsqd(&mut self, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(BrokerError::Connect("nsqd address must not be empty".to_string()));
        }
        self.check_connectable()?;

        let mut consumer = self.build(NSQConsumerConfigSources::Daemons(vec![addr.to_string()]));
        let first = await_healthy(&mut consumer, addr, self.connect_timeout).await?;
        self.spawn_dispatch(consumer, first);
        Ok(())
    }

    async fn connect_to_nsqlookupd(&mut self, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(BrokerError::Connect(
                "nsqlookupd address must not be empty".to_string(),
            ));
        }
        self.check_connectable()?;

        // nsqd connections appear only once the topic has producers, so
        // reachability of nsqlookupd itself is what gets checked.
        let url = lookupd_url(addr);
        ping_lookupd(&url, self.connect_timeout).await?;

        let mut addresses = HashSet::new();
        addresses.insert(url);
        let consumer = self.build(NSQConsumerConfigSources::Lookup(
            NSQConsumerLookupConfig::new().set_addresses(addresses),
        ));
        self.spawn_dispatch(consumer, None);
        Ok(())
    }

    async fn stop(&mut self) {
        // Dropping the tokio-nsq consumer closes its connections.
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
            info!(
                topic = %self.topic_name,
                channel = %self.channel_name,
                "NSQ consumer stopped"
            );
        }
    }
}

//! In-memory NSQ backend for testing.
//!
//! Behaves like a single nsqd: a published message is copied to every channel
//! of its topic and handed to one connected consumer per channel. Each
//! consumer gets its own dispatch task, so a handler that waits (full
//! subscription queue) stalls only that consumer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::{MessageHandler, NsqClientFactory, NsqConsumer, NsqMessage, NsqProducer};
use super::ConnectStrategy;
use crate::broker::{BrokerError, Result};

/// A message accepted by a mock producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub body: Vec<u8>,
}

/// A connect call made by a mock consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub topic: String,
    pub channel: String,
    pub strategy: ConnectStrategy,
    pub address: String,
}

struct ConnectedConsumer {
    id: u64,
    topic: String,
    channel: String,
    tx: mpsc::UnboundedSender<NsqMessage>,
}

#[derive(Default)]
struct MockState {
    published: Vec<PublishedMessage>,
    connections: Vec<ConnectionRecord>,
    consumers: Vec<ConnectedConsumer>,
    created_consumers: usize,
    producer_stops: usize,
    consumer_stops: usize,
    handled_messages: usize,
    next_message_id: u64,
    next_consumer_id: u64,
    fail_on_new_consumer: bool,
    fail_on_connect: bool,
    fail_on_publish: bool,
}

impl MockState {
    fn message(&mut self, body: Vec<u8>) -> NsqMessage {
        self.next_message_id += 1;
        NsqMessage {
            id: format!("{:016x}", self.next_message_id).into_bytes(),
            attempts: 1,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            body,
        }
    }

    /// Hand a message to one consumer per channel of `topic`.
    fn fan_out(&mut self, topic: &str, body: Vec<u8>) -> usize {
        let mut seen = HashSet::new();
        let targets: Vec<usize> = self
            .consumers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.topic == topic && seen.insert(c.channel.clone()))
            .map(|(i, _)| i)
            .collect();

        // nsqd gives every channel copy the same id.
        let message = self.message(body);
        for &i in &targets {
            let _ = self.consumers[i].tx.send(message.clone());
        }
        targets.len()
    }
}

/// Shared in-memory nsqd. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MockNsq {
    state: Arc<Mutex<MockState>>,
}

impl MockNsq {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_fail_on_new_consumer(&self, fail: bool) {
        self.lock().fail_on_new_consumer = fail;
    }

    pub fn set_fail_on_connect(&self, fail: bool) {
        self.lock().fail_on_connect = fail;
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.lock().fail_on_publish = fail;
    }

    /// Messages accepted by any producer, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Connect calls, in call order.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.lock().connections.clone()
    }

    /// Consumers currently connected.
    pub fn connected_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Consumers created through the factory, connected or not.
    pub fn created_consumers(&self) -> usize {
        self.lock().created_consumers
    }

    pub fn producer_stops(&self) -> usize {
        self.lock().producer_stops
    }

    pub fn consumer_stops(&self) -> usize {
        self.lock().consumer_stops
    }

    /// Messages whose handlers have all returned, across every consumer.
    pub fn handled_messages(&self) -> usize {
        self.lock().handled_messages
    }

    /// Deliver a prepared message to the first consumer on `topic`/`channel`.
    ///
    /// Returns false when no such consumer is connected.
    pub fn deliver(&self, topic: &str, channel: &str, message: NsqMessage) -> bool {
        let state = self.lock();
        state
            .consumers
            .iter()
            .find(|c| c.topic == topic && c.channel == channel)
            .map(|c| c.tx.send(message).is_ok())
            .unwrap_or(false)
    }
}

impl NsqClientFactory for MockNsq {
    fn new_producer(&self, addr: &str) -> Result<Box<dyn NsqProducer>> {
        if addr.is_empty() {
            return Err(BrokerError::Construction(
                "nsqd address must not be empty".to_string(),
            ));
        }
        Ok(Box::new(MockProducer {
            nsq: self.clone(),
            stopped: Mutex::new(false),
        }))
    }

    fn new_consumer(&self, topic: &str, channel: &str) -> Result<Box<dyn NsqConsumer>> {
        let mut state = self.lock();
        if state.fail_on_new_consumer {
            return Err(BrokerError::Construction(
                "Mock consumer creation failure".to_string(),
            ));
        }
        if topic.is_empty() || channel.is_empty() {
            return Err(BrokerError::Construction(format!(
                "invalid topic/channel '{}'/'{}'",
                topic, channel
            )));
        }
        state.created_consumers += 1;
        state.next_consumer_id += 1;

        Ok(Box::new(MockConsumer {
            nsq: self.clone(),
            id: state.next_consumer_id,
            topic: topic.to_string(),
            channel: channel.to_string(),
            handlers: Vec::new(),
            dispatch: None,
        }))
    }
}

struct MockProducer {
    nsq: MockNsq,
    stopped: Mutex<bool>,
}

#[async_trait]
impl NsqProducer for MockProducer {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        if *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(BrokerError::Publish("producer stopped".to_string()));
        }

        let mut state = self.nsq.lock();
        if state.fail_on_publish {
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            body: body.clone(),
        });
        let receivers = state.fan_out(topic, body);
        debug!(topic = %topic, receivers, "Mock published message");
        Ok(())
    }

    async fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.nsq.lock().producer_stops += 1;
    }
}

struct MockConsumer {
    nsq: MockNsq,
    id: u64,
    topic: String,
    channel: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
    dispatch: Option<JoinHandle<()>>,
}

impl MockConsumer {
    fn connect(&mut self, strategy: ConnectStrategy, addr: &str) -> Result<()> {
        let mut state = self.nsq.lock();
        state.connections.push(ConnectionRecord {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            strategy,
            address: addr.to_string(),
        });

        if state.fail_on_connect {
            return Err(BrokerError::Connect(format!(
                "Mock connect failure ({})",
                addr
            )));
        }
        if self.handlers.is_empty() {
            return Err(BrokerError::Connect("no handlers".to_string()));
        }
        if self.dispatch.is_some() {
            return Err(BrokerError::Connect("already connected".to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<NsqMessage>();
        let handlers = self.handlers.clone();
        let nsq = self.nsq.clone();
        self.dispatch = Some(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                for handler in &handlers {
                    // Requeue is not modelled.
                    let _ = handler.handle(message.clone()).await;
                }
                nsq.lock().handled_messages += 1;
            }
        }));

        state.consumers.push(ConnectedConsumer {
            id: self.id,
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            tx,
        });
        Ok(())
    }
}

#[async_trait]
impl NsqConsumer for MockConsumer {
    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    async fn connect_to_nsqd(&mut self, addr: &str) -> Result<()> {
        self.connect(ConnectStrategy::Nsqd, addr)
    }

    async fn connect_to_nsqlookupd(&mut self, addr: &str) -> Result<()> {
        self.connect(ConnectStrategy::Lookupd, addr)
    }

    async fn stop(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        let mut state = self.nsq.lock();
        state.consumers.retain(|c| c.id != self.id);
        state.consumer_stops += 1;
    }
}

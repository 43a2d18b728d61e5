//! NSQ client seam.
//!
//! The controller talks to NSQ only through these traits, so the real client
//! (`tokio_nsq` module, feature `nsq`) and the in-memory backend (`mock`) are
//! interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::broker::{BrokerError, Result};

/// A message as delivered by nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    /// Opaque message id.
    pub id: Vec<u8>,
    /// Delivery attempt, starting at 1.
    pub attempts: u16,
    /// Publish timestamp reported by nsqd (nanoseconds).
    pub timestamp: i64,
    pub body: Vec<u8>,
}

/// Handler for processing messages from a consumer.
///
/// Backends log an `Err` and finish the message anyway; there is no requeue path.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    fn handle(
        &self,
        message: NsqMessage,
    ) -> BoxFuture<'static, std::result::Result<(), BrokerError>>;
}

/// Publishing half of an NSQ client.
#[async_trait]
pub trait NsqProducer: Send + Sync {
    /// Publish a body to a topic.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;

    /// Stop the producer. Publishing afterwards fails.
    async fn stop(&self);
}

/// Consuming half of an NSQ client, bound to one topic/channel pair.
#[async_trait]
pub trait NsqConsumer: Send + Sync {
    /// Register a handler. Must be called before connecting.
    fn add_handler(&mut self, handler: Arc<dyn MessageHandler>);

    /// Connect straight to an nsqd instance.
    async fn connect_to_nsqd(&mut self, addr: &str) -> Result<()>;

    /// Connect to the nsqd instances an nsqlookupd reports for the topic.
    async fn connect_to_nsqlookupd(&mut self, addr: &str) -> Result<()>;

    /// Stop consuming. No handler runs afterwards.
    async fn stop(&mut self);
}

/// Creates producers and consumers.
pub trait NsqClientFactory: Send + Sync {
    /// Create a producer for the nsqd at `addr`.
    fn new_producer(&self, addr: &str) -> Result<Box<dyn NsqProducer>>;

    /// Create an unconnected consumer.
    fn new_consumer(&self, topic: &str, channel: &str) -> Result<Box<dyn NsqConsumer>>;
}

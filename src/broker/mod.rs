//! Broker controller interface.
//!
//! This module contains:
//! - `BrokerController` trait: publish, subscribe, topic discovery, shutdown
//! - `BrokerMessage`: generic envelope (headers + payload)
//! - `BrokerChannelSubscription`: bounded, cancellable message stream
//! - `BrokerError`: error kinds surfaced by every backend

use std::collections::HashMap;

use async_trait::async_trait;

pub mod subscription;

pub use subscription::{wait_for_cancellation_async, BrokerChannelSubscription};

/// Capacity of the bounded channel behind each subscription.
pub const BROKER_MESSAGES_QUEUE_SIZE: usize = 10;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Producer or consumer could not be created.
    #[error("Construction failed: {0}")]
    Construction(String),

    /// Connecting a consumer to nsqd or nsqlookupd failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// HTTP request to the discovery service failed or returned a non-200 status.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Discovery response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Producer-level send failed.
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Generic message envelope exchanged with the broker.
///
/// Header ordering is not preserved. The payload is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    pub headers: HashMap<String, Vec<u8>>,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    /// Create a message with no headers.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers.get(key).map(Vec::as_slice)
    }
}

/// Uniform interface over a topic-based messaging backend.
///
/// Identifiers are `<topic>` or `<topic>#<channel>`. How the channel part is
/// interpreted is up to the implementation.
///
/// Implementations:
/// - `NsqController`: NSQ via a pluggable client backend
#[async_trait]
pub trait BrokerController: Send + Sync {
    /// Publish a message.
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()>;

    /// Subscribe to messages.
    ///
    /// The returned subscription must be cancelled (or dropped) by the caller;
    /// `close` does not stop it.
    async fn subscribe(&self, channel: &str) -> Result<BrokerChannelSubscription>;

    /// List topics currently known to the backend.
    async fn lookup_topics(&self) -> Result<Vec<String>>;

    /// Close everything owned by the controller.
    async fn close(&self);
}

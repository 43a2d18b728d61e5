//! NSQ messaging configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::BROKER_MESSAGES_QUEUE_SIZE;
use crate::nsq::{ConnectStrategy, NsqControllerConfig};

/// NSQ connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NsqConfig {
    /// nsqd TCP address, or nsqlookupd HTTP address with `connect: lookupd`.
    pub address: String,
    /// How subscriptions connect (`nsqd` or `lookupd`).
    pub connect: ConnectStrategy,
    /// Capacity of each subscription's message queue.
    pub queue_size: usize,
    /// Topic lookup request timeout in seconds.
    pub lookup_timeout_secs: Option<u64>,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4150".to_string(),
            connect: ConnectStrategy::Nsqd,
            queue_size: BROKER_MESSAGES_QUEUE_SIZE,
            lookup_timeout_secs: None,
        }
    }
}

impl NsqConfig {
    /// Controller options described by this configuration.
    ///
    /// The logger is left unset; callers attach one with
    /// [`NsqControllerConfig::with_logger`].
    pub fn controller_config(&self) -> NsqControllerConfig {
        let config = NsqControllerConfig::default()
            .with_connect(self.connect)
            .with_queue_size(self.queue_size);

        match self.lookup_timeout_secs {
            Some(secs) => config.with_lookup_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

/// Settings for the `nsq-tail` binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Identifiers (`topic` or `topic#channel`) to subscribe to.
    pub subscribe: Vec<String>,
    /// Log the topic list from nsqlookupd at startup.
    pub list_topics: bool,
}

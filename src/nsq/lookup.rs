//! nsqlookupd topic discovery.
//!
//! `GET http://{address}/topics` answers `{"topics": ["a", "b"]}`.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::broker::{BrokerError, Result};

#[derive(Debug, Deserialize)]
struct TopicsBody {
    // Missing and null both mean no topics.
    #[serde(default)]
    topics: Option<Vec<String>>,
}

/// HTTP client for the nsqlookupd `/topics` endpoint.
#[derive(Debug, Clone)]
pub struct TopicLookupClient {
    client: Client,
    endpoint: String,
}

impl TopicLookupClient {
    /// Create a client for the nsqlookupd at `address` (`host:port`).
    ///
    /// `timeout` bounds each request; `None` waits indefinitely.
    pub fn new(address: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            BrokerError::Construction(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            endpoint: Self::topics_endpoint(address),
        })
    }

    /// Build the topics URL for an address.
    pub fn topics_endpoint(address: &str) -> String {
        format!("http://{}/topics", address)
    }

    /// URL queried by [`lookup_topics`](Self::lookup_topics).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the topic list, returned exactly as nsqlookupd sent it.
    pub async fn lookup_topics(&self) -> Result<Vec<String>> {
        let response = self.client.get(&self.endpoint).send().await.map_err(|e| {
            BrokerError::Transport(format!(
                "trying to get list of topics from nsqlookupd: {}",
                e
            ))
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(BrokerError::Transport(format!(
                "trying to get list of topics from nsqlookupd: HTTP {}",
                status
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            BrokerError::Transport(format!("reading response from nsqlookupd: {}", e))
        })?;

        let body: TopicsBody = serde_json::from_slice(&body).map_err(|e| {
            BrokerError::Decode(format!(
                "trying to parse response from nsqlookupd: {}",
                e
            ))
        })?;

        let topics = body.topics.unwrap_or_default();
        debug!(
            endpoint = %self.endpoint,
            topic_count = topics.len(),
            "Looked up topics"
        );

        Ok(topics)
    }
}

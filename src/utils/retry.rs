//! Retry utilities: backoff builders and retryable error classification.
//!
//! The controller never retries on its own. Callers that want retries wrap
//! controller calls with `backon` using these builders.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::broker::BrokerError;

/// Backoff for subscribing/connecting at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if a broker error is worth retrying.
///
/// Retryable:
/// - `Connect`: nsqd/nsqlookupd not reachable yet
/// - `Transport`: nsqlookupd HTTP failure
/// - `Publish`: producer connection dropped
///
/// Non-retryable:
/// - `Construction`: invalid topic/channel names never become valid
/// - `Decode`: nsqlookupd answered, but with something unexpected
pub fn is_retryable(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::Connect(_) | BrokerError::Transport(_) | BrokerError::Publish(_)
    )
}

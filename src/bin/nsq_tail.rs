//! nsq-tail: Follow NSQ topics and log what arrives.
//!
//! Subscribes to every identifier in `tail.subscribe` and logs each message
//! with its `X-MsgID`, `X-Attempts` and `X-Timestamp` headers. Ctrl-C cancels
//! the subscriptions and closes the controller.
//!
//! ## Configuration
//! - NSQ_BROKER_CONFIG: Path to a YAML config file (optional)
//! - NSQ_BROKER__NSQ__ADDRESS: nsqd / nsqlookupd address
//! - NSQ_BROKER__NSQ__CONNECT: `nsqd` or `lookupd`
//! - NSQ_BROKER__TAIL__LIST_TOPICS: Log the topic list at startup
//! - NSQ_BROKER_LOG: Log filter (default: info)

use std::time::Duration;

use backon::Retryable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use nsq_broker::broker::{
    BrokerChannelSubscription, BrokerController, BrokerError, BrokerMessage,
};
use nsq_broker::config::Config;
use nsq_broker::nsq::{NsqController, ATTEMPTS_HEADER, MESSAGE_ID_HEADER, TIMESTAMP_HEADER};
use nsq_broker::utils::bootstrap::{current_logger, init_tracing};
use nsq_broker::utils::retry::{connection_backoff, is_retryable};

fn header_str<'a>(message: &'a BrokerMessage, key: &str) -> std::borrow::Cow<'a, str> {
    String::from_utf8_lossy(message.header(key).unwrap_or_default())
}

fn spawn_tail(
    identifier: String,
    mut subscription: BrokerChannelSubscription,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    subscription.cancel();
                    break;
                }
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    info!(
                        identifier = %identifier,
                        message_id = %header_str(&message, MESSAGE_ID_HEADER),
                        attempts = %header_str(&message, ATTEMPTS_HEADER),
                        timestamp = %header_str(&message, TIMESTAMP_HEADER),
                        payload = %String::from_utf8_lossy(&message.payload),
                        "Message"
                    );
                }
            }
        }
        info!(identifier = %identifier, "Stopped tailing");
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let controller = NsqController::new(
        &config.nsq.address,
        config.nsq.controller_config().with_logger(current_logger()),
    )?;

    if config.tail.list_topics {
        match controller.lookup_topics().await {
            Ok(topics) => info!(?topics, "Topics"),
            Err(e) => warn!(error = %e, "Topic lookup failed"),
        }
    }

    if config.tail.subscribe.is_empty() {
        warn!("Nothing to tail, set tail.subscribe");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tails = Vec::with_capacity(config.tail.subscribe.len());

    for identifier in &config.tail.subscribe {
        let controller = &controller;
        let subscription = (move || async move { controller.subscribe(identifier).await })
            .retry(connection_backoff())
            .when(is_retryable)
            .notify(|err: &BrokerError, dur: Duration| {
                warn!(identifier = %identifier, error = %err, delay = ?dur, "Subscribe failed, retrying");
            })
            .await;

        match subscription {
            Ok(subscription) => {
                tails.push(spawn_tail(
                    identifier.clone(),
                    subscription,
                    shutdown_rx.clone(),
                ));
            }
            Err(e) => error!(identifier = %identifier, error = %e, "Giving up on subscription"),
        }
    }

    info!(address = %controller.address(), subscriptions = tails.len(), "nsq-tail started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    for tail in tails {
        let _ = tail.await;
    }
    controller.close().await;

    Ok(())
}

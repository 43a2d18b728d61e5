//! NSQ message to `BrokerMessage` mapping.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, Dispatch};

use super::client::{MessageHandler, NsqMessage};
use crate::broker::{BrokerError, BrokerMessage};

/// Header carrying the nsqd message id.
pub const MESSAGE_ID_HEADER: &str = "X-MsgID";
/// Header carrying the delivery attempt count, in decimal.
pub const ATTEMPTS_HEADER: &str = "X-Attempts";
/// Header carrying the nsqd timestamp, in decimal.
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Convert a delivered message, keeping the body byte-for-byte.
pub fn to_broker_message(message: NsqMessage) -> BrokerMessage {
    let headers = [
        (MESSAGE_ID_HEADER.to_string(), message.id),
        (
            ATTEMPTS_HEADER.to_string(),
            message.attempts.to_string().into_bytes(),
        ),
        (
            TIMESTAMP_HEADER.to_string(),
            message.timestamp.to_string().into_bytes(),
        ),
    ]
    .into_iter()
    .collect();

    BrokerMessage {
        headers,
        payload: message.body,
    }
}

/// Forwards every message into a subscription's bounded channel.
///
/// Waits while the channel is full. Always reports success to nsqd, so a
/// message is finished even when the subscription has gone away.
pub(crate) struct ForwardingHandler {
    tx: mpsc::Sender<BrokerMessage>,
    logger: Dispatch,
}

impl ForwardingHandler {
    pub(crate) fn new(tx: mpsc::Sender<BrokerMessage>, logger: Dispatch) -> Self {
        Self { tx, logger }
    }
}

impl MessageHandler for ForwardingHandler {
    fn handle(&self, message: NsqMessage) -> BoxFuture<'static, Result<(), BrokerError>> {
        let tx = self.tx.clone();
        Box::pin(
            async move {
                let message = to_broker_message(message);
                if tx.send(message).await.is_err() {
                    debug!("Subscription closed, discarding message");
                }
                Ok(())
            }
            .with_subscriber(self.logger.clone()),
        )
    }
}

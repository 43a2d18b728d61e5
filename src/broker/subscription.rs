//! Bounded, cancellable subscription handle.
//!
//! A subscription pairs the receiving half of a bounded channel with the
//! sending half of a one-shot cancellation channel. Whoever created the
//! backend consumer keeps the cancellation receiver and hands it, together
//! with the consumer's stop procedure, to [`wait_for_cancellation_async`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::BrokerMessage;

/// Messages received on one topic/channel pair.
///
/// Dropping the handle has the same effect as [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct BrokerChannelSubscription {
    messages: mpsc::Receiver<BrokerMessage>,
    cancel: Option<oneshot::Sender<()>>,
}

impl BrokerChannelSubscription {
    /// Wrap a message receiver.
    ///
    /// Returns the subscription and the receiver that resolves once the
    /// subscription is cancelled or dropped.
    pub fn new(messages: mpsc::Receiver<BrokerMessage>) -> (Self, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            Self {
                messages,
                cancel: Some(cancel_tx),
            },
            cancel_rx,
        )
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the subscription is cancelled and every buffered
    /// message has been drained, or when the producing side is gone.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.messages.recv().await
    }

    /// Direct access to the underlying bounded receiver.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<BrokerMessage> {
        &mut self.messages
    }

    /// Cancel the subscription.
    ///
    /// Never blocks: the channel is closed so that pending and future
    /// forwarding sends fail immediately, and the stop procedure is signalled
    /// to run in the background. Messages already buffered can still be read.
    /// Calling this more than once has no further effect.
    pub fn cancel(&mut self) {
        self.messages.close();
        if let Some(cancel) = self.cancel.take() {
            // The watcher may already be gone if the runtime shut down.
            let _ = cancel.send(());
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Stream for BrokerChannelSubscription {
    type Item = BrokerMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().messages.poll_recv(cx)
    }
}

/// Run `stop` in the background once the subscription is cancelled.
///
/// The task also fires when the subscription handle is dropped without an
/// explicit cancel. Completion of `stop` is not reported anywhere.
pub fn wait_for_cancellation_async<F, Fut>(
    cancelled: oneshot::Receiver<()>,
    stop: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        // Ok: explicit cancel. Err: handle dropped.
        let _ = cancelled.await;
        stop().await;
    })
}

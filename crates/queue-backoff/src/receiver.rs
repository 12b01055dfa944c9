//! Cancellable streaming pull from a queue.
//!
//! [`MessageReceiver::stream`] spawns a single producer task that pulls
//! batches from the provider and hands messages one at a time to the returned
//! stream over a channel of capacity one. A pull starts only once the channel
//! slot is free, so an unread message holds the producer back before it leases
//! more messages. The cancel signal is checked before every pull and while a
//! message waits to be handed off; an in-flight pull is never interrupted.
//!
//! A failed pull ends the stream with a single `Err` item. Messages of a batch
//! that were not handed off before cancellation are dropped; the queue makes
//! them visible again once their lease expires.

use crate::client::{QueueProvider, ReceiveRequest};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::message::ReceivedMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, Instrument, Span};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Messages in the order they were received, ended by cancellation or a
/// terminal receive error
pub type MessageStream = ReceiverStream<Result<ReceivedMessage, QueueError>>;

/// Pulls messages from one queue and exposes them as a [`MessageStream`]
pub struct MessageReceiver {
    provider: Arc<dyn QueueProvider>,
    request: ReceiveRequest,
    span: Span,
}

impl MessageReceiver {
    /// Create a receiver for the queue named in `config`
    pub fn new(provider: Arc<dyn QueueProvider>, config: &QueueConfig) -> Self {
        let span = tracing::info_span!("receiver", queue = %config.queue_url.queue_name());
        Self {
            provider,
            request: ReceiveRequest::from_config(config),
            span,
        }
    }

    /// Record this receiver's events inside `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Start pulling; the stream ends once `cancel` holds `true`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self, cancel: watch::Receiver<bool>) -> MessageStream {
        let (tx, rx) = mpsc::channel(1);

        let pull_loop = PullLoop {
            provider: Arc::clone(&self.provider),
            request: self.request.clone(),
            tx,
            cancel,
        };
        tokio::spawn(pull_loop.run().instrument(self.span.clone()));

        ReceiverStream::new(rx)
    }
}

/// State owned by the producer task
struct PullLoop {
    provider: Arc<dyn QueueProvider>,
    request: ReceiveRequest,
    tx: mpsc::Sender<Result<ReceivedMessage, QueueError>>,
    cancel: watch::Receiver<bool>,
}

impl PullLoop {
    async fn run(mut self) {
        info!(
            queue_url = %self.request.queue_url,
            max_number_of_messages = self.request.max_number_of_messages,
            visibility_timeout_seconds = self.request.visibility_timeout_seconds,
            wait_time_seconds = self.request.wait_time_seconds,
            "Started pulling messages"
        );

        loop {
            // The slot must be free before leasing more messages
            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    info!("Receiving stopped");
                    return;
                }
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Message stream dropped by consumer");
                        return;
                    }
                },
            };

            let messages = match self.provider.receive_messages(&self.request).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, transient = e.is_transient(), "Message receive failed");
                    permit.send(Err(e));
                    return;
                }
            };

            debug!(count = messages.len(), "Pulled batch");

            let mut messages = messages.into_iter();
            let Some(first) = messages.next() else {
                continue;
            };
            if *self.cancel.borrow() {
                info!("Receiving stopped, undelivered messages of the batch are left to expire");
                return;
            }
            permit.send(Ok(first));

            for message in messages {
                if !self.emit(Ok(message)).await {
                    return;
                }
            }
        }
    }

    /// Hand one item to the consumer. `false` once the stream should end.
    async fn emit(&mut self, item: Result<ReceivedMessage, QueueError>) -> bool {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => {
                info!("Receiving stopped, undelivered messages of the batch are left to expire");
                false
            }
            sent = self.tx.send(item) => match sent {
                Ok(()) => true,
                Err(_) => {
                    debug!("Message stream dropped by consumer");
                    false
                }
            },
        }
    }
}

/// Resolves once the signal is set; never resolves if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

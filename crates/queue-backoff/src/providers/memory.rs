//! In-memory queue provider implementation for testing and development.
//!
//! Behaves like an SQS standard queue as far as the consumer can observe:
//! - Received messages are hidden for the request's visibility timeout
//! - Every delivery increments `ApproximateReceiveCount` and issues a new
//!   receipt handle; only the latest receipt controls the message
//! - `ReceiveMessage` long-polls up to the requested wait time
//!
//! Time is measured with `tokio::time`, so tests can drive visibility expiry
//! with a paused clock.

use crate::client::{QueueProvider, ReceiveRequest};
use crate::config::{InMemoryConfig, ProviderType};
use crate::error::QueueError;
use crate::message::{
    MessageAttributeValue, MessageId, QueueUrl, ReceiptHandle, ReceivedMessage, Timestamp,
    ALL_MESSAGE_ATTRIBUTES, APPROXIMATE_RECEIVE_COUNT, SENT_TIMESTAMP,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// System attribute holding the first delivery time in epoch milliseconds
pub const APPROXIMATE_FIRST_RECEIVE_TIMESTAMP: &str = "ApproximateFirstReceiveTimestamp";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueUrl, InMemoryQueue>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
        }
    }

    /// Get or create a queue
    fn get_or_create_queue(&mut self, queue_url: &QueueUrl) -> &mut InMemoryQueue {
        self.queues.entry(queue_url.clone()).or_default()
    }

    fn queue_mut(&mut self, queue_url: &QueueUrl) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_url: queue_url.to_string(),
            })
    }
}

/// Internal queue state for a single queue; messages kept in send order
#[derive(Default)]
struct InMemoryQueue {
    messages: Vec<StoredMessage>,
}

impl InMemoryQueue {
    /// Message currently leased under `receipt`
    fn leased_mut(&mut self, receipt: &ReceiptHandle) -> Option<&mut StoredMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.receipt.as_deref() == Some(receipt.as_str()))
    }

    /// Earliest time a hidden message becomes visible again
    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }
}

/// A message stored in the queue with delivery metadata
struct StoredMessage {
    message_id: MessageId,
    body: String,
    message_attributes: HashMap<String, MessageAttributeValue>,
    sent_at: Timestamp,
    first_received_at: Option<Timestamp>,
    receive_count: u32,
    visible_at: Instant,
    /// Receipt of the latest delivery
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    /// Lease the message and build what the consumer sees for this delivery
    fn deliver(
        &mut self,
        request: &ReceiveRequest,
        now: Instant,
    ) -> Result<ReceivedMessage, QueueError> {
        self.receive_count += 1;
        self.visible_at = now + Duration::from_secs(u64::from(request.visibility_timeout_seconds));
        let first_received_at = self
            .first_received_at
            .get_or_insert_with(Timestamp::now)
            .clone();

        let receipt = format!("{}#{}", self.message_id, uuid::Uuid::new_v4());
        self.receipt = Some(receipt.clone());

        let mut message = ReceivedMessage::new(
            self.message_id.clone(),
            ReceiptHandle::new(receipt)?,
            self.body.clone(),
        );

        let system_attributes = [
            (APPROXIMATE_RECEIVE_COUNT, self.receive_count.to_string()),
            (SENT_TIMESTAMP, self.sent_at.epoch_millis().to_string()),
            (
                APPROXIMATE_FIRST_RECEIVE_TIMESTAMP,
                first_received_at.epoch_millis().to_string(),
            ),
        ];
        for (name, value) in system_attributes {
            if is_selected(&request.attribute_names, name) {
                message = message.with_attribute(name, value);
            }
        }

        for (name, value) in &self.message_attributes {
            if is_selected(&request.message_attribute_names, name) {
                message = message.with_message_attribute(name.clone(), value.clone());
            }
        }

        Ok(message)
    }
}

/// `All` or an exact name selects an attribute
fn is_selected(selectors: &[String], name: &str) -> bool {
    selectors
        .iter()
        .any(|s| s == ALL_MESSAGE_ATTRIBUTES || s == name)
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider implementation
///
/// Queues are created on first use by [`InMemoryProvider::send_message`] or a
/// receive.
pub struct InMemoryProvider {
    storage: Arc<RwLock<QueueStorage>>,
    /// Woken whenever a message may have become receivable
    available: Arc<Notify>,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new(config))),
            available: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a message; it is immediately visible
    pub fn send_message(
        &self,
        queue_url: &QueueUrl,
        body: impl Into<String>,
    ) -> Result<MessageId, QueueError> {
        self.send_message_with_attributes(queue_url, body, HashMap::new())
    }

    /// Enqueue a message carrying custom message attributes
    pub fn send_message_with_attributes(
        &self,
        queue_url: &QueueUrl,
        body: impl Into<String>,
        message_attributes: HashMap<String, MessageAttributeValue>,
    ) -> Result<MessageId, QueueError> {
        let message_id = MessageId::new();
        {
            let mut storage = self.write()?;
            let max_queue_size = storage.config.max_queue_size;
            let queue = storage.get_or_create_queue(queue_url);

            if queue.messages.len() >= max_queue_size {
                return Err(QueueError::ProviderError {
                    provider: "InMemory".to_string(),
                    code: "QueueFull".to_string(),
                    message: format!("queue holds the maximum of {} messages", max_queue_size),
                });
            }

            queue.messages.push(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
                message_attributes,
                sent_at: Timestamp::now(),
                first_received_at: None,
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
        }

        self.available.notify_waiters();
        debug!(queue = %queue_url.queue_name(), message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    /// Number of messages held by the queue, visible or not
    pub fn message_count(&self, queue_url: &QueueUrl) -> Result<usize, QueueError> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage
            .queues
            .get(queue_url)
            .map_or(0, |queue| queue.messages.len()))
    }

    /// Number of messages currently hidden by a visibility timeout
    pub fn in_flight_count(&self, queue_url: &QueueUrl) -> Result<usize, QueueError> {
        let now = Instant::now();
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage.queues.get(queue_url).map_or(0, |queue| {
            queue.messages.iter().filter(|m| !m.is_visible(now)).count()
        }))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueStorage>, QueueError> {
        self.storage.write().map_err(|_| poisoned())
    }

    /// Deliver up to the requested number of visible messages.
    ///
    /// `Err(next)` when nothing is visible; `next` is when the earliest hidden
    /// message reappears.
    fn try_receive(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Result<Vec<ReceivedMessage>, Option<Instant>>, QueueError> {
        let now = Instant::now();
        let max = request
            .max_number_of_messages
            .clamp(1, ProviderType::InMemory.max_batch_size()) as usize;

        let mut storage = self.write()?;
        let queue = storage.get_or_create_queue(&request.queue_url);

        let mut delivered = Vec::new();
        for stored in queue.messages.iter_mut().filter(|m| m.is_visible(now)) {
            if delivered.len() == max {
                break;
            }
            delivered.push(stored.deliver(request, now)?);
        }

        if delivered.is_empty() {
            return Ok(Err(queue.next_visible_at(now)));
        }
        Ok(Ok(delivered))
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProvider").finish_non_exhaustive()
    }
}

fn poisoned() -> QueueError {
    QueueError::ProviderError {
        provider: "InMemory".to_string(),
        code: "LockPoisoned".to_string(),
        message: "queue storage lock poisoned".to_string(),
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline =
            Instant::now() + Duration::from_secs(u64::from(request.wait_time_seconds));

        loop {
            // Registered before checking so a send in between is not missed
            let notified = self.available.notified();

            let next_visible_at = match self.try_receive(request)? {
                Ok(messages) => {
                    debug!(
                        queue = %request.queue_url.queue_name(),
                        count = messages.len(),
                        "Messages delivered"
                    );
                    return Ok(messages);
                }
                Err(next_visible_at) => next_visible_at,
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn change_message_visibility(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut storage = self.write()?;
            let message = storage
                .queue_mut(queue_url)?
                .leased_mut(receipt)
                .filter(|m| !m.is_visible(now))
                .ok_or_else(|| QueueError::MessageNotFound {
                    receipt: receipt.abbreviated().to_string(),
                })?;

            message.visible_at = now + Duration::from_secs(u64::from(timeout_seconds));
        }

        // Waiting receives recompute when the next message becomes visible
        self.available.notify_waiters();
        Ok(())
    }

    async fn delete_message(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        let queue = storage.queue_mut(queue_url)?;

        let index = queue
            .messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt.as_str()))
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.abbreviated().to_string(),
            })?;
        let removed = queue.messages.remove(index);

        debug!(message_id = %removed.message_id, "Message deleted");
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

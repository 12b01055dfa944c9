//! Redelivery backoff for received messages.
//!
//! Every message handed to [`BackoffController::handle`] is either deleted, once
//! its attempt count has passed the [`RetryLimit`], or hidden again for the
//! delay the [`BackoffSchedule`] assigns to that attempt. The controller does
//! not know whether processing succeeded: every observed message is subject to
//! backoff regardless of outcome, and removal happens only when the retry
//! limit is exceeded.
//!
//! ```text
//! attempt count > retry limit          -> DeleteMessage
//! attempt count in schedule (1..=6)    -> ChangeMessageVisibility(schedule[count])
//! anything else, including unreadable  -> ChangeMessageVisibility(default delay)
//! ```
//!
//! Failures of the control calls are logged and swallowed. The queue's own
//! visibility and retention mechanics make a lost call safe: the message is
//! simply redelivered sooner than intended.

use crate::client::QueueProvider;
use crate::config::{BackoffConfig, QueueConfig};
use crate::message::{QueueUrl, ReceivedMessage, Timestamp};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;

/// Attempt count used when the receive-count attribute is missing or unparseable
pub const INVALID_ATTEMPT_COUNT: i64 = -1;

// ============================================================================
// Schedule and limit
// ============================================================================

/// Total mapping from attempt count to redelivery delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    /// Delay in seconds for attempt `index + 1`
    delays_seconds: Vec<u32>,
    default_delay_seconds: u32,
}

impl BackoffSchedule {
    /// Create a schedule where `delays_seconds[n - 1]` applies to attempt `n`
    pub fn new(delays_seconds: Vec<u32>, default_delay_seconds: u32) -> Self {
        Self {
            delays_seconds,
            default_delay_seconds,
        }
    }

    /// Delay in seconds for the given attempt count; counts without an entry
    /// get the default delay
    pub fn delay_seconds(&self, attempt_count: i64) -> u32 {
        usize::try_from(attempt_count)
            .ok()
            .and_then(|count| count.checked_sub(1))
            .and_then(|index| self.delays_seconds.get(index))
            .copied()
            .unwrap_or(self.default_delay_seconds)
    }
}

impl Default for BackoffSchedule {
    /// 30, 40, 45, 50, 55 and 60 seconds for attempts one to six; 30 otherwise
    fn default() -> Self {
        Self::new(vec![30, 40, 45, 50, 55, 60], 30)
    }
}

/// Attempt count above which a message is removed instead of delayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimit(u32);

impl RetryLimit {
    pub fn new(limit: u32) -> Self {
        Self(limit)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Strictly greater than the limit
    pub fn is_exceeded_by(&self, attempt_count: i64) -> bool {
        attempt_count > i64::from(self.0)
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self(6)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Control call chosen for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Remove the message permanently
    Delete,
    /// Hide the message for this many seconds from now
    ChangeVisibility { timeout_seconds: u32 },
}

/// Pure decision half of the controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule: BackoffSchedule,
    retry_limit: RetryLimit,
}

impl BackoffPolicy {
    pub fn new(schedule: BackoffSchedule, retry_limit: RetryLimit) -> Self {
        Self {
            schedule,
            retry_limit,
        }
    }

    /// Decide between delete and a visibility change for an attempt count
    pub fn decide(&self, attempt_count: i64) -> BackoffDecision {
        if self.retry_limit.is_exceeded_by(attempt_count) {
            return BackoffDecision::Delete;
        }

        BackoffDecision::ChangeVisibility {
            timeout_seconds: self.schedule.delay_seconds(attempt_count),
        }
    }

    pub fn retry_limit(&self) -> RetryLimit {
        self.retry_limit
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            BackoffSchedule::new(config.delays_seconds.clone(), config.default_delay_seconds),
            RetryLimit::new(config.retry_limit),
        )
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Applies the backoff policy to received messages through a queue provider.
///
/// Holds no mutable state; `handle` may run concurrently for many messages.
pub struct BackoffController {
    provider: Arc<dyn QueueProvider>,
    queue_url: QueueUrl,
    policy: BackoffPolicy,
    span: Span,
}

impl BackoffController {
    /// Create a controller for the queue named in `config`
    pub fn new(
        provider: Arc<dyn QueueProvider>,
        config: &QueueConfig,
        policy: BackoffPolicy,
    ) -> Self {
        let span = tracing::info_span!("backoff", queue = %config.queue_url.queue_name());
        Self {
            provider,
            queue_url: config.queue_url.clone(),
            policy,
            span,
        }
    }

    /// Record this controller's events inside `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Delete or delay `message` according to its attempt count.
    ///
    /// Never fails: control-call errors are logged. Returns the decision that
    /// was applied so callers can record it.
    pub async fn handle(&self, message: &ReceivedMessage) -> BackoffDecision {
        self.handle_inner(message)
            .instrument(self.span.clone())
            .await
    }

    async fn handle_inner(&self, message: &ReceivedMessage) -> BackoffDecision {
        let attempt_count = attempt_count(message);

        info!(
            handled_at = %Timestamp::now().to_rfc3339(),
            message_id = %message.message_id,
            receipt_handle = %message.receipt_handle.abbreviated(),
            attempt_count,
            "Applying redelivery backoff"
        );

        let decision = self.policy.decide(attempt_count);
        match decision {
            BackoffDecision::Delete => self.delete(message, attempt_count).await,
            BackoffDecision::ChangeVisibility { timeout_seconds } => {
                self.change_visibility(message, timeout_seconds).await
            }
        }

        decision
    }

    async fn delete(&self, message: &ReceivedMessage, attempt_count: i64) {
        info!(
            message_id = %message.message_id,
            attempt_count,
            retry_limit = self.policy.retry_limit().get(),
            "Retry limit exceeded, deleting message"
        );

        match self
            .provider
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
        {
            Ok(()) => debug!(message_id = %message.message_id, "Message deleted"),
            Err(e) => warn!(
                message_id = %message.message_id,
                error = %e,
                "Deleting message failed"
            ),
        }
    }

    async fn change_visibility(&self, message: &ReceivedMessage, timeout_seconds: u32) {
        info!(
            message_id = %message.message_id,
            delay_seconds = timeout_seconds,
            "Message will be visible again after delay"
        );

        if let Err(e) = self
            .provider
            .change_message_visibility(&self.queue_url, &message.receipt_handle, timeout_seconds)
            .await
        {
            warn!(
                message_id = %message.message_id,
                delay_seconds = timeout_seconds,
                error = %e,
                "Could not change message visibility"
            );
        }
    }
}

impl std::fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffController")
            .field("provider", &self.provider.provider_type())
            .field("queue_url", &self.queue_url)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Attempt count of a message, or [`INVALID_ATTEMPT_COUNT`] when unreadable
fn attempt_count(message: &ReceivedMessage) -> i64 {
    match message.approximate_receive_count() {
        Ok(count) => count,
        Err(e) => {
            warn!(
                message_id = %message.message_id,
                error = %e,
                "Unreadable receive count, using default delay"
            );
            INVALID_ATTEMPT_COUNT
        }
    }
}

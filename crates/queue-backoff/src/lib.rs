//! # Queue Backoff
//!
//! Client-side redelivery backoff for Amazon SQS consumers.
//!
//! This library provides:
//! - A cancellable message stream fed by long-polling receives
//! - A backoff controller that delays each redelivery by a per-attempt schedule
//!   and deletes messages once they pass the retry limit
//! - An SQS provider speaking the HTTP query API and an in-memory provider for
//!   tests
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Received messages, receipt handles and attributes
//! - [`config`] - Queue, backoff and provider configuration
//! - [`client`] - The provider trait and receive parameters
//! - [`receiver`] - Streaming pull with cancellation
//! - [`backoff`] - Schedule, retry limit and the controller applying them
//! - [`providers`] - AWS SQS and in-memory providers
//!
//! ## Example
//!
//! ```no_run
//! use queue_backoff::{
//!     BackoffController, BackoffPolicy, InMemoryProvider, MessageReceiver, QueueConfig,
//!     QueueUrl,
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use tokio_stream::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(InMemoryProvider::default());
//! let config = QueueConfig::new(QueueUrl::new(
//!     "http://localhost:4566/000000000000/orders".to_string(),
//! )?);
//!
//! let receiver = MessageReceiver::new(provider.clone(), &config);
//! let controller = BackoffController::new(provider, &config, BackoffPolicy::default());
//!
//! let (_cancel, cancel_rx) = watch::channel(false);
//! let mut messages = receiver.stream(cancel_rx);
//! while let Some(message) = messages.next().await {
//!     controller.handle(&message?).await;
//! }
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod providers;
pub mod receiver;

// Re-export commonly used types at crate root for convenience
pub use backoff::{
    BackoffController, BackoffDecision, BackoffPolicy, BackoffSchedule, RetryLimit,
    INVALID_ATTEMPT_COUNT,
};
pub use client::{QueueProvider, ReceiveRequest};
pub use config::{AwsSqsConfig, BackoffConfig, InMemoryConfig, ProviderType, QueueConfig};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{
    MessageAttributeValue, MessageId, QueueUrl, ReceiptHandle, ReceivedMessage, Timestamp,
};
pub use providers::{AwsSqsProvider, InMemoryProvider};
pub use receiver::{MessageReceiver, MessageStream};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

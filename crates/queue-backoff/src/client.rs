//! Provider seam between the consumer core and a remote queue service.

use crate::config::{ProviderType, QueueConfig};
use crate::error::QueueError;
use crate::message::{
    QueueUrl, ReceiptHandle, ReceivedMessage, ALL_MESSAGE_ATTRIBUTES, APPROXIMATE_RECEIVE_COUNT,
    SENT_TIMESTAMP,
};
use async_trait::async_trait;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Parameters of a single receive (pull) call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue_url: QueueUrl,
    pub max_number_of_messages: u32,
    /// Server-side long-poll wait
    pub wait_time_seconds: u32,
    /// Invisibility window leased to the received messages
    pub visibility_timeout_seconds: u32,
    /// System attributes to return with each message
    pub attribute_names: Vec<String>,
    /// Custom message attributes to return with each message
    pub message_attribute_names: Vec<String>,
}

impl ReceiveRequest {
    /// Build the request issued on every pull cycle.
    ///
    /// Asks for the sent timestamp, the receive count and all custom attributes.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            queue_url: config.queue_url.clone(),
            max_number_of_messages: config.max_number_of_messages,
            wait_time_seconds: config.wait_time_seconds,
            visibility_timeout_seconds: config.visibility_timeout_seconds,
            attribute_names: vec![
                SENT_TIMESTAMP.to_string(),
                APPROXIMATE_RECEIVE_COUNT.to_string(),
            ],
            message_attribute_names: vec![ALL_MESSAGE_ATTRIBUTES.to_string()],
        }
    }
}

/// Interface implemented by specific queue providers (AWS SQS, in-memory)
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Pull up to `request.max_number_of_messages` messages; may return none
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Hide the delivery identified by `receipt` for `timeout_seconds` from now
    async fn change_message_visibility(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError>;

    /// Permanently remove the delivery identified by `receipt`
    async fn delete_message(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

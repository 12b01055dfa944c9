//! Message types for queue operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// System attribute carrying the number of times a message has been delivered
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// System attribute carrying the epoch-millisecond time the message was sent
pub const SENT_TIMESTAMP: &str = "SentTimestamp";

/// Selector requesting every custom message attribute
pub const ALL_MESSAGE_ATTRIBUTES: &str = "All";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue address (an SQS queue URL)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueUrl(String);

impl QueueUrl {
    /// Create new queue URL with validation
    pub fn new(url: String) -> Result<Self, ValidationError> {
        if url.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_url".to_string(),
            });
        }

        let parsed = url::Url::parse(&url).map_err(|e| ValidationError::InvalidFormat {
            field: "queue_url".to_string(),
            message: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        if parsed.host_str().is_none() {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: "missing host".to_string(),
            });
        }

        let has_queue_segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|last| !last.is_empty())
            .unwrap_or(false);
        if !has_queue_segment {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: "path must end with the queue name".to_string(),
            });
        }

        Ok(Self(url))
    }

    /// Get queue URL as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Queue name, the last path segment of the URL
    pub fn queue_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for QueueUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueUrl {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueUrl {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueUrl> for String {
    fn from(value: QueueUrl) -> Self {
        value.0
    }
}

/// Unique identifier for messages within the queue system
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque per-delivery token required to delete or change visibility of a message
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(handle: String) -> Result<Self, ValidationError> {
        if handle.is_empty() {
            return Err(ValidationError::Required {
                field: "receipt_handle".to_string(),
            });
        }

        Ok(Self(handle))
    }

    /// Get handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log output; SQS handles run to hundreds of characters
    pub fn abbreviated(&self) -> &str {
        match self.0.char_indices().nth(24) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Debug for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReceiptHandle")
            .field(&self.abbreviated())
            .finish()
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Milliseconds since the Unix epoch
    pub fn epoch_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// RFC 3339 rendering used in log output
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A custom attribute attached to a message by its producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttributeValue {
    /// `String`, `Number` or `Binary`, optionally with a custom suffix (`Number.int`)
    pub data_type: String,
    pub string_value: Option<String>,
    pub binary_value: Option<Bytes>,
}

impl MessageAttributeValue {
    /// Create a string-typed attribute
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".to_string(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    /// Create a number-typed attribute
    pub fn number(value: impl Into<String>) -> Self {
        Self {
            data_type: "Number".to_string(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    /// Create a binary-typed attribute
    pub fn binary(value: Bytes) -> Self {
        Self {
            data_type: "Binary".to_string(),
            string_value: None,
            binary_value: Some(value),
        }
    }
}

/// A message received from the queue, valid for one handling attempt
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub md5_of_body: Option<String>,
    /// System attributes requested on receive (`ApproximateReceiveCount`, `SentTimestamp`, ...)
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
}

impl ReceivedMessage {
    /// Create a message with no attributes
    pub fn new(message_id: MessageId, receipt_handle: ReceiptHandle, body: String) -> Self {
        Self {
            message_id,
            receipt_handle,
            body,
            md5_of_body: None,
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
        }
    }

    /// Add a system attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a custom message attribute
    pub fn with_message_attribute(
        mut self,
        key: impl Into<String>,
        value: MessageAttributeValue,
    ) -> Self {
        self.message_attributes.insert(key.into(), value);
        self
    }

    /// Number of times the queue has delivered this message.
    ///
    /// Fails when the attribute was not requested, is absent or is not an integer.
    pub fn approximate_receive_count(&self) -> Result<i64, SerializationError> {
        let raw = self.attributes.get(APPROXIMATE_RECEIVE_COUNT).ok_or_else(|| {
            SerializationError::InvalidAttribute {
                key: APPROXIMATE_RECEIVE_COUNT.to_string(),
            }
        })?;

        raw.trim()
            .parse::<i64>()
            .map_err(|_| SerializationError::InvalidAttribute {
                key: APPROXIMATE_RECEIVE_COUNT.to_string(),
            })
    }

    /// Time the producer sent this message, if the attribute is present and valid
    pub fn sent_timestamp(&self) -> Option<Timestamp> {
        self.attributes
            .get(SENT_TIMESTAMP)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(Timestamp::from_epoch_millis)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

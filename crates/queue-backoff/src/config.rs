//! Provider types and configuration.

use crate::error::{ConfigurationError, ValidationError};
use crate::message::QueueUrl;
use serde::{Deserialize, Serialize};

/// Longest server-side long-poll wait SQS accepts
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Largest receive batch SQS accepts
pub const MAX_BATCH_SIZE: u32 = 10;

/// Longest visibility timeout SQS accepts (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AwsSqs,
    InMemory,
}

impl ProviderType {
    /// Get maximum number of messages returned by one receive call
    pub fn max_batch_size(&self) -> u32 {
        match self {
            Self::AwsSqs => MAX_BATCH_SIZE,
            Self::InMemory => 100,
        }
    }
}

// ============================================================================
// Queue configuration
// ============================================================================

/// Immutable settings shared by the receiver and the backoff controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Address of the queue to consume
    pub queue_url: QueueUrl,

    /// Seconds a received message stays hidden from other consumers
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u32,

    /// Server-side long-poll wait per receive call
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: u32,

    /// Maximum messages requested per receive call
    #[serde(default = "default_max_number_of_messages")]
    pub max_number_of_messages: u32,
}

fn default_visibility_timeout_seconds() -> u32 {
    30
}

fn default_wait_time_seconds() -> u32 {
    MAX_WAIT_TIME_SECONDS
}

fn default_max_number_of_messages() -> u32 {
    MAX_BATCH_SIZE
}

impl QueueConfig {
    /// Create configuration for a queue with default timings
    pub fn new(queue_url: QueueUrl) -> Self {
        Self {
            queue_url,
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
            wait_time_seconds: default_wait_time_seconds(),
            max_number_of_messages: default_max_number_of_messages(),
        }
    }

    /// Set the visibility timeout leased on receive
    pub fn with_visibility_timeout_seconds(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    /// Set the long-poll wait
    pub fn with_wait_time_seconds(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    /// Set the receive batch size
    pub fn with_max_number_of_messages(mut self, count: u32) -> Self {
        self.max_number_of_messages = count;
        self
    }

    /// Check every value against the limits the queue service enforces
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.visibility_timeout_seconds > MAX_VISIBILITY_TIMEOUT_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "visibility_timeout_seconds".to_string(),
                message: format!("must be 0-{}", MAX_VISIBILITY_TIMEOUT_SECONDS),
            });
        }

        if self.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "wait_time_seconds".to_string(),
                message: format!("must be 0-{}", MAX_WAIT_TIME_SECONDS),
            });
        }

        if self.max_number_of_messages == 0 || self.max_number_of_messages > MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "max_number_of_messages".to_string(),
                message: format!("must be 1-{}", MAX_BATCH_SIZE),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Backoff configuration
// ============================================================================

/// Redelivery policy: delay per attempt and the attempt count after which
/// messages are deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay in seconds for attempt 1, 2, ... in order
    #[serde(default = "default_delays_seconds")]
    pub delays_seconds: Vec<u32>,

    /// Delay used for attempt counts outside the schedule, including unreadable ones
    #[serde(default = "default_delay_seconds")]
    pub default_delay_seconds: u32,

    /// Attempt counts strictly above this are deleted
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_delays_seconds() -> Vec<u32> {
    vec![30, 40, 45, 50, 55, 60]
}

fn default_delay_seconds() -> u32 {
    30
}

fn default_retry_limit() -> u32 {
    6
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delays_seconds: default_delays_seconds(),
            default_delay_seconds: default_delay_seconds(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.delays_seconds.is_empty() {
            return Err(ValidationError::Required {
                field: "delays_seconds".to_string(),
            });
        }

        let all_delays = self
            .delays_seconds
            .iter()
            .chain(std::iter::once(&self.default_delay_seconds));
        for delay in all_delays {
            if *delay > MAX_VISIBILITY_TIMEOUT_SECONDS {
                return Err(ValidationError::OutOfRange {
                    field: "delays_seconds".to_string(),
                    message: format!(
                        "delay {} exceeds {} seconds",
                        delay, MAX_VISIBILITY_TIMEOUT_SECONDS
                    ),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Provider configuration
// ============================================================================

/// AWS SQS configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AwsSqsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
    /// Override for the regional endpoint, e.g. a LocalStack URL
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// HTTP timeout per request; must exceed the long-poll wait
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl Default for AwsSqsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl AwsSqsConfig {
    /// Fill unset credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    /// and `AWS_SESSION_TOKEN`
    pub fn with_env_credentials(self) -> Self {
        self.with_credentials_from(|key| std::env::var(key).ok())
    }

    fn with_credentials_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if self.access_key_id.is_none() && self.secret_access_key.is_none() {
            self.access_key_id = non_empty("AWS_ACCESS_KEY_ID");
            self.secret_access_key = non_empty("AWS_SECRET_ACCESS_KEY");
            if self.session_token.is_none() {
                self.session_token = non_empty("AWS_SESSION_TOKEN");
            }
        }
        self
    }

    /// Endpoint requests are sent to
    pub fn endpoint(&self) -> String {
        match &self.endpoint_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://sqs.{}.amazonaws.com", self.region),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "region".to_string(),
            });
        }

        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(ConfigurationError::Invalid {
                message: "access_key_id and secret_access_key must be set together".to_string(),
            });
        }

        if let Some(endpoint) = &self.endpoint_url {
            url::Url::parse(endpoint).map_err(|e| ConfigurationError::Invalid {
                message: format!("endpoint_url: {}", e),
            })?;
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "request_timeout_seconds must be positive".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for AwsSqsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSqsConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint_url", &self.endpoint_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    pub max_queue_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

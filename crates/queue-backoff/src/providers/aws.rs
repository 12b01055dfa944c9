//! AWS SQS provider implementation using the HTTP query API.
//!
//! Requests go straight to the SQS endpoint with `reqwest` and are signed
//! with AWS Signature Version 4. Going through HTTP rather than the AWS SDK
//! keeps the provider testable against a mocked server.
//!
//! ## Operations
//!
//! - `ReceiveMessage` with long polling, a leased visibility timeout, system
//!   attribute selectors and custom message attribute selectors
//! - `ChangeMessageVisibility`
//! - `DeleteMessage`
//!
//! ## Authentication
//!
//! Explicit access keys from [`AwsSqsConfig`], or the standard `AWS_*`
//! environment variables via [`AwsSqsConfig::with_env_credentials`]. Temporary
//! credentials add the `x-amz-security-token` header.
//!
//! ## Example
//!
//! ```no_run
//! use queue_backoff::providers::AwsSqsProvider;
//! use queue_backoff::AwsSqsConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AwsSqsConfig {
//!     region: "us-east-1".to_string(),
//!     ..Default::default()
//! }
//! .with_env_credentials();
//!
//! let provider = AwsSqsProvider::new(config)?;
//! # Ok(())
//! # }
//! ```

use crate::client::{QueueProvider, ReceiveRequest};
use crate::config::{AwsSqsConfig, ProviderType, MAX_BATCH_SIZE, MAX_WAIT_TIME_SECONDS};
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::message::{
    MessageAttributeValue, MessageId, QueueUrl, ReceiptHandle, ReceivedMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";

// ============================================================================
// Error Types
// ============================================================================

/// AWS SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {0}")]
    ServiceError(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError(_) => true, // Most SQS errors are transient
            Self::Throttled(_) => true,
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::ServiceError(msg) => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code: "ServiceError".to_string(),
                message: msg,
            },
            Self::Throttled(msg) => QueueError::Throttled { message: msg },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue_url: queue },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::ConfigurationError(msg) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message: msg })
            }
            Self::SerializationError(msg) => {
                QueueError::SerializationError(SerializationError::MalformedResponse {
                    message: msg,
                })
            }
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
///
/// See <https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html>
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
        region: String,
    ) -> Self {
        Self {
            access_key,
            secret_key,
            session_token,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign an HTTP request with AWS Signature V4
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, for temporary credentials,
    /// `x-amz-security-token`.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Task 1: Create canonical request
        let canonical_query_string = canonical_query_string(query_params);

        // Canonical headers (must be sorted)
        let (canonical_headers, signed_headers) = match &self.session_token {
            Some(token) => (
                format!(
                    "host:{}\nx-amz-date:{}\nx-amz-security-token:{}\n",
                    host, amz_date, token
                ),
                "host;x-amz-date;x-amz-security-token",
            ),
            None => (
                format!("host:{}\nx-amz-date:{}\n", host, amz_date),
                "host;x-amz-date",
            ),
        };

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        // Task 2: Create string to sign
        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        // Task 3: Calculate signature
        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        // Task 4: Build authorization header
        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization_header);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        if let Some(token) = &self.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        headers
    }

    /// Derive the signing key with the HMAC-SHA256 chain
    /// `AWS4{secret} -> date -> region -> service -> aws4_request`, then sign
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

/// Compute HMAC-SHA256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encoded `key=value` pairs sorted by key
fn canonical_query_string(query_params: &HashMap<String, String>) -> String {
    let mut pairs = query_params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// AWS SQS Provider
// ============================================================================

/// AWS SQS queue provider implementation
///
/// Thread-safe; share it across tasks with `Arc`.
pub struct AwsSqsProvider {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    config: AwsSqsConfig,
    endpoint: url::Url,
}

impl AwsSqsProvider {
    /// Create new AWS SQS provider
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built. Missing credentials are not an error here; every
    /// request fails with an authentication error instead.
    pub fn new(config: AwsSqsConfig) -> Result<Self, AwsError> {
        config
            .validate()
            .map_err(|e| AwsError::ConfigurationError(e.to_string()))?;

        let signer = if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            Some(AwsV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.session_token.clone(),
                config.region.clone(),
            ))
        } else {
            None
        };

        let endpoint = url::Url::parse(&config.endpoint())
            .map_err(|e| AwsError::ConfigurationError(format!("Invalid endpoint: {}", e)))?;

        // Long polls hold the connection for up to the wait time, so the
        // request timeout comes from config rather than a fixed value
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            config,
            endpoint,
        })
    }

    /// `host[:port]` as sent in the Host header
    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Make an HTTP request to AWS SQS with signature
    async fn make_request(
        &self,
        method: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
    ) -> Result<String, AwsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| AwsError::Authentication("No credentials configured".to_string()))?;

        let host = self.host();
        let timestamp = Utc::now();
        let auth_headers = signer.sign_request(method, &host, path, query_params, body, &timestamp);

        // Build URL with query parameters
        let base = self.endpoint.as_str().trim_end_matches('/');
        let mut url = format!("{}{}", base, path);
        if !query_params.is_empty() {
            url = format!("{}?{}", url, canonical_query_string(query_params));
        }

        let mut request = self.http_client.request(
            method
                .parse()
                .map_err(|e| AwsError::ConfigurationError(format!("Invalid HTTP method: {}", e)))?,
            &url,
        );

        for (key, value) in auth_headers {
            request = request.header(&key, value);
        }

        if !body.is_empty() {
            request = request.body(body.to_string());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(self.parse_error_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }

    /// Common parameters of every action against one queue
    fn action_params(action: &str, queue_url: &QueueUrl) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), queue_url.as_str().to_string());
        params
    }

    /// Parse error response from XML
    fn parse_error_response(&self, xml: &str, status_code: u16) -> AwsError {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut error_code = None;
        let mut error_message = None;
        let mut in_error = false;
        let mut in_code = false;
        let mut in_message = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                    b"Error" => in_error = true,
                    b"Code" if in_error => in_code = true,
                    b"Message" if in_error => in_message = true,
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    if in_code {
                        error_code = e.unescape().ok().map(|s| s.into_owned());
                        in_code = false;
                    } else if in_message {
                        error_message = e.unescape().ok().map(|s| s.into_owned());
                        in_message = false;
                    }
                }
                Ok(Event::End(ref e)) if e.local_name().as_ref() == b"Error" => {
                    in_error = false;
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }

        let code = error_code.unwrap_or_else(|| "Unknown".to_string());
        let message = error_message.unwrap_or_else(|| format!("HTTP status {}", status_code));

        // Map AWS error codes to our error types
        match code.as_str() {
            "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
                AwsError::QueueNotFound(message)
            }
            "InvalidClientTokenId"
            | "UnrecognizedClientException"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "AccessDenied" => AwsError::Authentication(format!("{}: {}", code, message)),
            "ReceiptHandleIsInvalid"
            | "InvalidReceiptHandle"
            | "AWS.SimpleQueueService.MessageNotInflight"
            | "MessageNotInflight" => AwsError::InvalidReceipt(format!("{}: {}", code, message)),
            "RequestThrottled" | "ThrottlingException" | "Throttling" => {
                AwsError::Throttled(format!("{}: {}", code, message))
            }
            _ if status_code == 401 || status_code == 403 => {
                AwsError::Authentication(format!("{}: {}", code, message))
            }
            _ => AwsError::ServiceError(format!("{}: {}", code, message)),
        }
    }

    /// Parse ReceiveMessage XML response
    fn parse_receive_message_response(&self, xml: &str) -> Result<Vec<ReceivedMessage>, AwsError> {
        let mut reader = Reader::from_str(xml);

        let mut messages = Vec::new();
        let mut current: Option<MessageFields> = None;
        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut text = String::new();
        let mut buf = Vec::new();

        loop {
            let event = reader.read_event_into(&mut buf).map_err(|e| {
                AwsError::SerializationError(format!("XML parsing error: {}", e))
            })?;

            match event {
                Event::Start(ref e) => {
                    let name = e.local_name().as_ref().to_vec();
                    if name == b"Message" && current.is_none() {
                        current = Some(MessageFields::default());
                    }
                    path.push(name);
                    text.clear();
                }
                Event::Empty(ref e) => {
                    // Self-closing leaf such as <Body/>
                    let name = e.local_name().as_ref().to_vec();
                    if let Some(fields) = current.as_mut() {
                        fields.assign(&path, &name, String::new())?;
                    }
                }
                Event::Text(ref e) => {
                    let unescaped = e.unescape().map_err(|e| {
                        AwsError::SerializationError(format!("Failed to parse XML: {}", e))
                    })?;
                    text.push_str(&unescaped);
                }
                Event::CData(e) => {
                    text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
                Event::End(_) => {
                    let name = path.pop().unwrap_or_default();
                    if name == b"Message" {
                        if let Some(fields) = current.take() {
                            messages.push(fields.build()?);
                        }
                    } else if let Some(fields) = current.as_mut() {
                        fields.assign(&path, &name, std::mem::take(&mut text))?;
                    }
                    text.clear();
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(messages)
    }
}

/// Fields collected while walking one `<Message>` element
#[derive(Default)]
struct MessageFields {
    message_id: Option<String>,
    receipt_handle: Option<String>,
    body: Option<String>,
    md5_of_body: Option<String>,
    attributes: HashMap<String, String>,
    message_attributes: HashMap<String, MessageAttributeValue>,
    attribute_name: Option<String>,
    attribute_value: Option<String>,
    message_attribute_name: Option<String>,
    message_attribute: Option<MessageAttributeValue>,
}

impl MessageFields {
    /// Store the text of the element `name` that just closed; `path` holds its ancestors
    fn assign(&mut self, path: &[Vec<u8>], name: &[u8], text: String) -> Result<(), AwsError> {
        let parent = path.last().map(Vec::as_slice).unwrap_or_default();
        let grandparent = path
            .len()
            .checked_sub(2)
            .and_then(|i| path.get(i))
            .map(Vec::as_slice)
            .unwrap_or_default();

        match (grandparent, parent, name) {
            (_, b"Message", b"MessageId") => self.message_id = Some(text),
            (_, b"Message", b"ReceiptHandle") => self.receipt_handle = Some(text),
            (_, b"Message", b"Body") => self.body = Some(text),
            (_, b"Message", b"MD5OfBody") => self.md5_of_body = Some(text),

            // <Attribute><Name/><Value/></Attribute>
            (_, b"Attribute", b"Name") => self.attribute_name = Some(text),
            (_, b"Attribute", b"Value") => self.attribute_value = Some(text),
            (_, b"Message", b"Attribute") => {
                if let (Some(key), Some(value)) =
                    (self.attribute_name.take(), self.attribute_value.take())
                {
                    self.attributes.insert(key, value);
                }
            }

            // <MessageAttribute><Name/><Value><StringValue/><DataType/></Value></MessageAttribute>
            (_, b"MessageAttribute", b"Name") => self.message_attribute_name = Some(text),
            (b"MessageAttribute", b"Value", b"DataType") => {
                self.message_attribute_mut().data_type = text;
            }
            (b"MessageAttribute", b"Value", b"StringValue") => {
                self.message_attribute_mut().string_value = Some(text);
            }
            (b"MessageAttribute", b"Value", b"BinaryValue") => {
                use base64::{engine::general_purpose::STANDARD, Engine};
                let decoded = STANDARD.decode(text.trim()).map_err(|e| {
                    AwsError::SerializationError(format!("Base64 decode failed: {}", e))
                })?;
                self.message_attribute_mut().binary_value = Some(bytes::Bytes::from(decoded));
            }
            (_, b"Message", b"MessageAttribute") => {
                if let (Some(key), Some(value)) = (
                    self.message_attribute_name.take(),
                    self.message_attribute.take(),
                ) {
                    self.message_attributes.insert(key, value);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn message_attribute_mut(&mut self) -> &mut MessageAttributeValue {
        self.message_attribute.get_or_insert_with(|| MessageAttributeValue {
            data_type: String::new(),
            string_value: None,
            binary_value: None,
        })
    }

    fn build(self) -> Result<ReceivedMessage, AwsError> {
        let message_id = self
            .message_id
            .as_deref()
            .map(MessageId::from_str)
            .transpose()
            .map_err(|e| AwsError::SerializationError(e.to_string()))?
            .ok_or_else(|| AwsError::SerializationError("Message without MessageId".to_string()))?;

        let receipt_handle = self
            .receipt_handle
            .ok_or_else(|| {
                AwsError::SerializationError("Message without ReceiptHandle".to_string())
            })
            .and_then(|handle| {
                ReceiptHandle::new(handle).map_err(|e| AwsError::SerializationError(e.to_string()))
            })?;

        Ok(ReceivedMessage {
            message_id,
            receipt_handle,
            body: self.body.unwrap_or_default(),
            md5_of_body: self.md5_of_body,
            attributes: self.attributes,
            message_attributes: self.message_attributes,
        })
    }
}

impl fmt::Debug for AwsSqsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsProvider")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

#[async_trait]
impl QueueProvider for AwsSqsProvider {
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut params = Self::action_params("ReceiveMessage", &request.queue_url);
        params.insert(
            "MaxNumberOfMessages".to_string(),
            request.max_number_of_messages.clamp(1, MAX_BATCH_SIZE).to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            request.wait_time_seconds.min(MAX_WAIT_TIME_SECONDS).to_string(),
        );
        params.insert(
            "VisibilityTimeout".to_string(),
            request.visibility_timeout_seconds.to_string(),
        );
        for (index, name) in request.attribute_names.iter().enumerate() {
            params.insert(format!("AttributeName.{}", index + 1), name.clone());
        }
        for (index, name) in request.message_attribute_names.iter().enumerate() {
            params.insert(format!("MessageAttributeName.{}", index + 1), name.clone());
        }

        let response = self
            .make_request("POST", "/", &params, "")
            .await
            .map_err(|e| e.to_queue_error())?;

        let messages = self
            .parse_receive_message_response(&response)
            .map_err(|e| e.to_queue_error())?;

        debug!(
            queue = %request.queue_url.queue_name(),
            count = messages.len(),
            "ReceiveMessage completed"
        );
        Ok(messages)
    }

    async fn change_message_visibility(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        let mut params = Self::action_params("ChangeMessageVisibility", queue_url);
        params.insert("ReceiptHandle".to_string(), receipt.as_str().to_string());
        params.insert("VisibilityTimeout".to_string(), timeout_seconds.to_string());

        // ChangeMessageVisibility returns an empty result on success
        self.make_request("POST", "/", &params, "")
            .await
            .map_err(|e| e.to_queue_error())?;

        Ok(())
    }

    async fn delete_message(
        &self,
        queue_url: &QueueUrl,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let mut params = Self::action_params("DeleteMessage", queue_url);
        params.insert("ReceiptHandle".to_string(), receipt.as_str().to_string());

        self.make_request("POST", "/", &params, "")
            .await
            .map_err(|e| e.to_queue_error())?;

        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsSqs
    }
}

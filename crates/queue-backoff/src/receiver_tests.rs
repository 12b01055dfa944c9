//! Tests for the streaming receiver.

use super::*;
use crate::config::ProviderType;
use crate::message::{MessageId, QueueUrl, ReceiptHandle};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_stream::StreamExt;

// ============================================================================
// Mock QueueProvider for Testing
// ============================================================================

/// Replays scripted pull results, then long-polls empty forever
struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Vec<ReceivedMessage>, QueueError>>>,
    pull_delay: Duration,
    pulls: AtomicUsize,
    requests: Mutex<Vec<ReceiveRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<Vec<ReceivedMessage>, QueueError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            pull_delay: Duration::ZERO,
            pulls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueProvider for ScriptedProvider {
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(Duration::from_secs(u64::from(request.wait_time_seconds)))
                    .await;
                Ok(Vec::new())
            }
        }
    }

    async fn change_message_visibility(
        &self,
        _queue_url: &QueueUrl,
        _receipt: &ReceiptHandle,
        _timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn delete_message(
        &self,
        _queue_url: &QueueUrl,
        _receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

// ============================================================================
// Test Helper Functions
// ============================================================================

fn test_config() -> QueueConfig {
    QueueConfig::new(
        QueueUrl::new("https://sqs.us-east-1.amazonaws.com/123456789012/orders".to_string())
            .unwrap(),
    )
    .with_visibility_timeout_seconds(60)
    .with_wait_time_seconds(20)
    .with_max_number_of_messages(5)
}

fn message(body: &str) -> ReceivedMessage {
    ReceivedMessage::new(
        MessageId::new(),
        ReceiptHandle::new(format!("receipt-{}", body)).unwrap(),
        body.to_string(),
    )
}

fn batch(bodies: &[&str]) -> Result<Vec<ReceivedMessage>, QueueError> {
    Ok(bodies.iter().map(|b| message(b)).collect())
}

fn receiver(provider: &Arc<ScriptedProvider>) -> MessageReceiver {
    MessageReceiver::new(provider.clone(), &test_config())
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_messages_emitted_individually_in_order() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        batch(&["a", "b"]),
        batch(&["c"]),
    ]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let message = stream.next().await.unwrap().unwrap();
        bodies.push(message.body);
    }

    assert_eq!(bodies, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_pull_uses_configured_parameters() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["a"])]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    stream.next().await.unwrap().unwrap();

    let request = provider.requests.lock().unwrap()[0].clone();
    assert_eq!(request.max_number_of_messages, 5);
    assert_eq!(request.wait_time_seconds, 20);
    assert_eq!(request.visibility_timeout_seconds, 60);
    assert!(request
        .attribute_names
        .contains(&"ApproximateReceiveCount".to_string()));
    assert!(request.attribute_names.contains(&"SentTimestamp".to_string()));
    assert_eq!(request.message_attribute_names, vec!["All".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_pulls_do_not_end_stream() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        batch(&[]),
        batch(&[]),
        batch(&["late"]),
    ]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    // "late" waits unread in the handoff slot, so no fourth pull starts
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.pulls(), 3);

    let message = stream.next().await.unwrap().unwrap();
    assert_eq!(message.body, "late");
}

#[tokio::test(start_paused = true)]
async fn test_unread_message_blocks_next_pull() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["a"]), batch(&["b"])]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.pulls(), 1, "pulled again while 'a' was unread");

    assert_eq!(stream.next().await.unwrap().unwrap().body, "a");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.pulls(), 2);
    assert_eq!(stream.next().await.unwrap().unwrap().body, "b");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_at_most_one_batch_leased() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["a"]), batch(&["b"])]));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    tokio::time::sleep(Duration::from_secs(60)).await;
    cancel_tx.send(true).unwrap();

    // The message already handed off is still readable; nothing else was pulled
    assert_eq!(stream.next().await.unwrap().unwrap().body, "a");
    assert!(stream.next().await.is_none());
    assert_eq!(provider.pulls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_signal_closes_without_pulling() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["never"])]));
    let (_cancel_tx, cancel_rx) = watch::channel(true);
    let mut stream = receiver(&provider).stream(cancel_rx);

    assert!(stream.next().await.is_none());
    assert_eq!(provider.pulls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_emission_of_remaining_batch() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["first", "second", "third"])]));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.body, "first");

    cancel_tx.send(true).unwrap();

    // "second" may already sit in the handoff slot; nothing after it is emitted
    let mut remaining = Vec::new();
    while let Some(item) = stream.next().await {
        remaining.push(item.unwrap().body);
    }
    assert!(remaining.len() <= 1, "emitted {:?}", remaining);
    assert!(!remaining.contains(&"third".to_string()));
    assert_eq!(provider.pulls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_waits_for_in_flight_pull() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![batch(&["in-flight"])]).with_pull_delay(Duration::from_secs(20)),
    );
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    // Let the producer start its pull
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(provider.pulls(), 1);

    cancel_tx.send(true).unwrap();

    let started = tokio::time::Instant::now();
    assert!(stream.next().await.is_none());
    // The pull was not interrupted
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(provider.pulls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_receive_failure_ends_stream_with_error() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        batch(&["ok"]),
        Err(QueueError::AuthenticationFailed {
            message: "expired token".to_string(),
        }),
        batch(&["unreachable"]),
    ]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    assert_eq!(stream.next().await.unwrap().unwrap().body, "ok");
    assert!(matches!(
        stream.next().await,
        Some(Err(QueueError::AuthenticationFailed { .. }))
    ));
    assert!(stream.next().await.is_none());
    assert_eq!(provider.pulls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_cancel_sender_keeps_stream_running() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["a"]), batch(&["b"])]));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);
    drop(cancel_tx);

    assert_eq!(stream.next().await.unwrap().unwrap().body, "a");
    assert_eq!(stream.next().await.unwrap().unwrap().body, "b");
}

#[tokio::test(start_paused = true)]
async fn test_dropping_stream_stops_producer() {
    let provider = Arc::new(ScriptedProvider::new(vec![batch(&["a", "b", "c"])]));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver(&provider).stream(cancel_rx);

    stream.next().await.unwrap().unwrap();
    drop(stream);

    // Give the producer time to notice; it must not pull again
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.pulls(), 1);
}

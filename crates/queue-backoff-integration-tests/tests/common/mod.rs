//! Common test utilities for queue-backoff integration tests
//!
//! This module provides:
//! - Queue fixtures for the in-memory provider
//! - A consumer that records every delivery it hands to the backoff controller

use queue_backoff::{
    BackoffController, BackoffDecision, BackoffPolicy, InMemoryProvider, MessageReceiver,
    QueueConfig, QueueUrl,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;

pub fn queue_url() -> QueueUrl {
    QueueUrl::new("http://localhost:4566/000000000000/orders".to_string()).unwrap()
}

/// Receive parameters with a short long-poll so paused-clock tests cycle quickly
pub fn queue_config() -> QueueConfig {
    QueueConfig::new(queue_url())
        .with_wait_time_seconds(5)
        .with_visibility_timeout_seconds(30)
        .with_max_number_of_messages(10)
}

/// One message observed by the consumer
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Delivery {
    pub body: String,
    pub attempt_count: i64,
    pub at: Instant,
    pub decision: BackoffDecision,
}

/// Receiver plus controller running in a background task
pub struct Consumer {
    cancel: watch::Sender<bool>,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    task: JoinHandle<()>,
}

impl Consumer {
    pub fn spawn(
        provider: Arc<InMemoryProvider>,
        config: QueueConfig,
        policy: BackoffPolicy,
    ) -> Self {
        Self::spawn_with_limit(provider, config, policy, usize::MAX)
    }

    /// Stop consuming on its own after `limit` messages
    #[allow(dead_code)]
    pub fn spawn_with_limit(
        provider: Arc<InMemoryProvider>,
        config: QueueConfig,
        policy: BackoffPolicy,
        limit: usize,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let receiver = MessageReceiver::new(provider.clone(), &config);
        let controller = BackoffController::new(provider, &config, policy);
        let recorded = Arc::clone(&deliveries);

        let task = tokio::spawn(async move {
            let mut stream = receiver.stream(cancel_rx);
            while let Some(item) = stream.next().await {
                let message = item.expect("in-memory receive never fails");
                let attempt_count = message.approximate_receive_count().unwrap_or(-1);
                let decision = controller.handle(&message).await;

                let mut recorded = recorded.lock().unwrap();
                recorded.push(Delivery {
                    body: message.body.clone(),
                    attempt_count,
                    at: Instant::now(),
                    decision,
                });
                if recorded.len() >= limit {
                    break;
                }
            }
        });

        Self {
            cancel,
            deliveries,
            task,
        }
    }

    /// Wait until the consumer ended by itself
    pub async fn finished(self) -> Vec<Delivery> {
        self.task.await.unwrap();
        let deliveries = self.deliveries.lock().unwrap().clone();
        deliveries
    }

    /// Raise the cancel signal and wait for the stream to end
    pub async fn stop(self) -> Vec<Delivery> {
        let _ = self.cancel.send(true);
        self.finished().await
    }
}

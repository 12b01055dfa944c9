//! Tests for the crate-level wiring of receiver, controller and providers.

use super::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Records each event's message with the names of its enclosing spans
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<(String, Vec<&'static str>)>>>);

impl EventLog {
    fn spans_of(&self, message: &str) -> Vec<&'static str> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(recorded, _)| recorded == message)
            .map(|(_, spans)| spans.clone())
            .unwrap_or_else(|| panic!("no event {:?} recorded", message))
    }
}

impl<S> Layer<S> for EventLog
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let mut message = MessageField::default();
        event.record(&mut message);
        let spans = ctx
            .event_scope(event)
            .map(|scope| scope.map(|span| span.name()).collect())
            .unwrap_or_default();
        self.0.lock().unwrap().push((message.0, spans));
    }
}

#[derive(Default)]
struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig::new(
        QueueUrl::new("http://localhost:4566/000000000000/orders".to_string()).unwrap(),
    )
    .with_wait_time_seconds(1)
    .with_visibility_timeout_seconds(5)
}

#[test]
fn test_provider_types() {
    assert_eq!(ProviderType::AwsSqs.max_batch_size(), 10);
    assert_eq!(ProviderType::InMemory.max_batch_size(), 100);
    assert_eq!(InMemoryProvider::default().provider_type(), ProviderType::InMemory);
}

#[test]
fn test_error_transience() {
    assert!(!QueueError::QueueNotFound {
        queue_url: "test".to_string(),
    }
    .is_transient());

    assert!(QueueError::ConnectionFailed {
        message: "network error".to_string(),
    }
    .is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_received_message_is_delayed_by_schedule() {
    let provider = Arc::new(InMemoryProvider::default());
    let config = queue_config();
    provider.send_message(&config.queue_url, "payload").unwrap();

    let receiver = MessageReceiver::new(provider.clone(), &config);
    let controller = BackoffController::new(provider.clone(), &config, BackoffPolicy::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver.stream(cancel_rx);

    let message = stream.next().await.unwrap().unwrap();
    let decision = controller.handle(&message).await;
    cancel_tx.send(true).unwrap();

    assert_eq!(
        decision,
        BackoffDecision::ChangeVisibility {
            timeout_seconds: 30
        }
    );

    // Hidden beyond the 5 second lease the receive took
    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(provider.in_flight_count(&config.queue_url).unwrap(), 1);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(provider.in_flight_count(&config.queue_url).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_supplied_span_encloses_component_events() {
    let log = EventLog::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let provider = Arc::new(InMemoryProvider::default());
    let config = queue_config();
    provider.send_message(&config.queue_url, "payload").unwrap();

    let worker_span = tracing::info_span!("order_worker");
    let receiver = MessageReceiver::new(provider.clone(), &config).with_span(worker_span.clone());
    let controller = BackoffController::new(provider.clone(), &config, BackoffPolicy::default())
        .with_span(worker_span);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut stream = receiver.stream(cancel_rx);

    let message = stream.next().await.unwrap().unwrap();
    controller.handle(&message).await;
    cancel_tx.send(true).unwrap();

    assert_eq!(log.spans_of("Started pulling messages"), vec!["order_worker"]);
    assert_eq!(
        log.spans_of("Applying redelivery backoff"),
        vec!["order_worker"]
    );
}

#[tokio::test]
async fn test_components_record_in_default_spans() {
    let log = EventLog::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let provider = Arc::new(InMemoryProvider::default());
    let controller = BackoffController::new(provider, &queue_config(), BackoffPolicy::default());
    let message = ReceivedMessage::new(
        MessageId::new(),
        ReceiptHandle::new("receipt-1".to_string()).unwrap(),
        String::new(),
    );

    controller.handle(&message).await;

    assert_eq!(log.spans_of("Applying redelivery backoff"), vec!["backoff"]);
}

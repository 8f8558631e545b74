//! Tests for treeline-telemetry: webhook retry policy, queue drain +
//! Codex batching, emitter drop semantics.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use treeline_core::{CodexEventPayload, EventKind, PersistableEvent, TimelineEvent};
use treeline_telemetry::webhook::post_with_retry;
use treeline_telemetry::{
    EventPersistenceWorker, EventQueue, PostError, QueueItem, Transport, WebhookClient,
};

#[derive(Clone, Debug)]
struct RecordedPost {
    url: String,
    body: Value,
}

/// Transport stub that fails a scripted number of times before succeeding.
struct FlakyTransport {
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    failures_remaining: Arc<Mutex<u32>>,
    failure: fn() -> PostError,
}

impl FlakyTransport {
    fn reliable() -> (Self, Arc<Mutex<Vec<RecordedPost>>>) {
        Self::failing(0, || PostError::Transport("unused".into()))
    }

    fn failing(
        failures: u32,
        failure: fn() -> PostError,
    ) -> (Self, Arc<Mutex<Vec<RecordedPost>>>) {
        let posts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                posts: posts.clone(),
                failures_remaining: Arc::new(Mutex::new(failures)),
                failure,
            },
            posts,
        )
    }
}

#[async_trait::async_trait]
impl Transport for FlakyTransport {
    async fn post(&self, url: &str, token: &str, body: &Value) -> Result<(), PostError> {
        assert_eq!(token, "secret");
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err((self.failure)());
        }
        self.posts.lock().unwrap().push(RecordedPost {
            url: url.to_string(),
            body: body.clone(),
        });
        Ok(())
    }
}

fn client_with(transport: FlakyTransport) -> WebhookClient {
    WebhookClient::with_transport("http://hooks.test/runs", "secret", "run-7", Arc::new(transport))
}

// ===========================================================================
// Webhook client
// ===========================================================================

#[tokio::test]
async fn publish_wraps_payload_in_event_envelope() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    let handle = client
        .publish(EventKind::RunLog, json!({"message": "hi", "level": "info"}))
        .unwrap();
    assert!(handle.await.unwrap());
    let posts = posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url, "http://hooks.test/runs/run-7/run-log");
    assert_eq!(posts[0].body["event"]["message"], "hi");
}

#[tokio::test]
async fn kinds_without_endpoints_are_dropped() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    assert!(client
        .publish(EventKind::BestNodeSelected, json!({"node_id": "1"}))
        .is_none());
    assert!(posts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retries_5xx_until_fifth_attempt_succeeds() {
    let (transport, posts) = FlakyTransport::failing(4, || PostError::Status(503));
    let result = post_with_retry(
        &transport,
        "http://hooks.test/runs/run-7/run-log",
        "secret",
        &json!({"event": {}}),
    )
    .await;
    assert!(result.is_ok());
    // Delivered exactly once after four 503s.
    assert_eq!(posts.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_five_attempts() {
    let (transport, posts) = FlakyTransport::failing(99, || PostError::Status(500));
    let result = post_with_retry(&transport, "http://x", "secret", &json!({})).await;
    assert!(result.is_err());
    assert!(posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_retriable_4xx_fails_immediately() {
    let (transport, _posts) = FlakyTransport::failing(99, || PostError::Status(422));
    let started = std::time::Instant::now();
    let result = post_with_retry(&transport, "http://x", "secret", &json!({})).await;
    assert!(matches!(result, Err(PostError::Status(422))));
    // No backoff sleeps happened.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn retriability_classification() {
    assert!(PostError::Transport("conn reset".into()).is_retriable());
    assert!(PostError::Status(429).is_retriable());
    assert!(PostError::Status(503).is_retriable());
    assert!(!PostError::Status(404).is_retriable());
    assert!(!PostError::Status(400).is_retriable());
}

#[tokio::test]
async fn helper_endpoints_hit_expected_paths() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    assert!(client.publish_run_started().await.unwrap());
    assert!(client.publish_heartbeat().await.unwrap());
    assert!(client
        .publish_run_finished(false, Some("boom"))
        .await
        .unwrap());
    assert!(client
        .publish_gpu_shortage(4, 1, Some("need more"))
        .await
        .unwrap());
    let posts = posts.lock().unwrap();
    let urls: Vec<&str> = posts.iter().map(|p| p.url.as_str()).collect();
    assert!(urls.contains(&"http://hooks.test/runs/run-7/run-started"));
    assert!(urls.contains(&"http://hooks.test/runs/run-7/heartbeat"));
    assert!(urls.contains(&"http://hooks.test/runs/run-7/run-finished"));
    assert!(urls.contains(&"http://hooks.test/runs/run-7/gpu-shortage"));
    let finished = posts
        .iter()
        .find(|p| p.url.ends_with("/run-finished"))
        .unwrap();
    assert_eq!(finished.body["success"], false);
    assert_eq!(finished.body["message"], "boom");
}

#[tokio::test]
async fn bulk_codex_endpoint_takes_an_events_array() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    let items = vec![treeline_telemetry::CodexEventItem {
        stage: "1_initial_implementation".into(),
        node: 0,
        event_type: "turn.completed".into(),
        event_content: json!({}),
        occurred_at: "t".into(),
    }];
    assert!(client.publish_codex_events_bulk(items).unwrap().await.unwrap());
    assert!(client.publish_codex_events_bulk(vec![]).is_none());
    let posts = posts.lock().unwrap();
    assert_eq!(posts[0].url, "http://hooks.test/runs/run-7/codex-events-bulk");
    assert_eq!(posts[0].body["events"].as_array().unwrap().len(), 1);
}

// ===========================================================================
// Event queue + drain worker
// ===========================================================================

fn codex_event(n: usize) -> TimelineEvent {
    TimelineEvent::CodexEvent(CodexEventPayload {
        stage: "1_initial_implementation".into(),
        node: n,
        event_type: "turn.completed".into(),
        event_content: "{}".into(),
        occurred_at: "2025-01-01T00:00:00Z".into(),
    })
}

async fn settle() {
    // Let the drain worker and its spawned publish tasks run.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn drain_dispatches_non_codex_events_individually() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    let (emitter, rx) = EventQueue::bounded(64);
    let worker = tokio::spawn(EventPersistenceWorker::new(client).run(rx));

    emitter.emit(&TimelineEvent::run_log("one", "info"));
    emitter.emit(&TimelineEvent::run_log("two", "warn"));
    emitter.shutdown().await;
    worker.await.unwrap();
    settle().await;

    let posts = posts.lock().unwrap();
    assert_eq!(posts.len(), 2);
    assert!(posts.iter().all(|p| p.url.ends_with("/run-log")));
}

#[tokio::test]
async fn codex_events_flush_in_bulk_at_batch_size() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    let (emitter, rx) = EventQueue::bounded(512);
    let worker = tokio::spawn(EventPersistenceWorker::new(client).run(rx));

    for n in 0..200 {
        emitter.emit(&codex_event(n));
    }
    emitter.shutdown().await;
    worker.await.unwrap();
    settle().await;

    let posts = posts.lock().unwrap();
    // One bulk flush at 200 items; nothing went to the per-event endpoint.
    assert_eq!(posts.len(), 1);
    assert!(posts[0].url.ends_with("/codex-events-bulk"));
    assert_eq!(posts[0].body["events"].as_array().unwrap().len(), 200);
}

#[tokio::test]
async fn shutdown_flushes_a_partial_codex_buffer() {
    let (transport, posts) = FlakyTransport::reliable();
    let client = client_with(transport);
    let (emitter, rx) = EventQueue::bounded(64);
    let worker = tokio::spawn(EventPersistenceWorker::new(client).run(rx));

    for n in 0..3 {
        emitter.emit(&codex_event(n));
    }
    emitter.emit(&TimelineEvent::run_log("interleaved", "info"));
    emitter.shutdown().await;
    worker.await.unwrap();
    settle().await;

    let posts = posts.lock().unwrap();
    assert_eq!(posts.len(), 2);
    let bulk = posts
        .iter()
        .find(|p| p.url.ends_with("/codex-events-bulk"))
        .unwrap();
    assert_eq!(bulk.body["events"].as_array().unwrap().len(), 3);
    assert!(posts.iter().any(|p| p.url.ends_with("/run-log")));
}

#[tokio::test]
async fn full_queue_drops_events_without_blocking() {
    let (emitter, mut rx) = EventQueue::bounded(1);
    emitter.emit(&TimelineEvent::run_log("kept", "info"));
    // The queue is full; this drop must not block or panic.
    emitter.emit(&TimelineEvent::run_log("dropped", "info"));

    let first = rx.recv().await.unwrap();
    match first {
        QueueItem::Event(PersistableEvent { kind, data }) => {
            assert_eq!(kind, EventKind::RunLog);
            assert_eq!(data["message"], "kept");
        }
        QueueItem::Shutdown => panic!("expected an event"),
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn noop_emitter_is_inert() {
    let emitter = treeline_telemetry::EventEmitter::noop();
    emitter.emit(&TimelineEvent::run_log("nowhere", "info"));
    emitter.shutdown().await;
}

#[tokio::test]
async fn drain_survives_publish_failures() {
    // Every post fails; events are dropped but the worker keeps running.
    let (transport, posts) = FlakyTransport::failing(99, || PostError::Status(404));
    let client = client_with(transport);
    let (emitter, rx) = EventQueue::bounded(16);
    let worker = tokio::spawn(EventPersistenceWorker::new(client).run(rx));

    emitter.emit(&TimelineEvent::run_log("lost", "info"));
    emitter.emit(&TimelineEvent::run_log("also lost", "info"));
    emitter.shutdown().await;
    worker.await.unwrap();
    settle().await;
    assert!(posts.lock().unwrap().is_empty());
}

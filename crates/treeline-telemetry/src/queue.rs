//! Bounded event queue: many producers, one drain task.
//!
//! Producers never block; a full queue drops the event with a warning
//! (events are best-effort telemetry). The drain task forwards events to the
//! webhook client, batching Codex events through an in-drainer buffer.

use crate::webhook::{CodexEventItem, WebhookClient};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use treeline_core::{EventKind, PersistableEvent, TimelineEvent};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const CODEX_BATCH_SIZE: usize = 200;
pub const CODEX_BATCH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum QueueItem {
    Event(PersistableEvent),
    /// Stop sentinel: flush buffers and exit the drain loop.
    Shutdown,
}

pub struct EventQueue;

impl EventQueue {
    pub fn bounded(capacity: usize) -> (EventEmitter, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventEmitter { tx: Some(tx) }, rx)
    }
}

/// Producer-side shim: logs every event locally, then enqueues its
/// persistence record (when it has one) without blocking.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<QueueItem>>,
}

impl EventEmitter {
    /// An emitter that only logs locally; used by tests and tooling.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: &TimelineEvent) {
        debug!(target: "treeline.events", kind = event.kind_label(), "{}", event.summary());
        let Some(tx) = &self.tx else {
            return;
        };
        let Some(record) = event.persistence_record() else {
            return;
        };
        if tx.try_send(QueueItem::Event(record)).is_err() {
            warn!("event queue is full; dropping telemetry event");
        }
    }

    /// Enqueue the stop sentinel. Producers keep working; the drain task
    /// flushes and exits once it reaches the sentinel.
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(QueueItem::Shutdown).await;
        }
    }
}

struct CodexEventBuffer {
    events: Vec<CodexEventItem>,
    last_flush: Instant,
}

impl CodexEventBuffer {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    fn add(&mut self, item: CodexEventItem) {
        self.events.push(item);
    }

    fn should_flush(&self) -> bool {
        if self.events.is_empty() {
            return false;
        }
        self.events.len() >= CODEX_BATCH_SIZE || self.last_flush.elapsed() >= CODEX_BATCH_INTERVAL
    }

    fn take(&mut self) -> Vec<CodexEventItem> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.events)
    }
}

fn codex_item_from_record(data: &Value) -> CodexEventItem {
    CodexEventItem {
        stage: data
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        node: data
            .get("node")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize,
        event_type: data
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        // The full payload travels as content.
        event_content: data.clone(),
        occurred_at: data
            .get("occurred_at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Owns the drain loop that dispatches queued events via webhooks.
pub struct EventPersistenceWorker {
    webhook: WebhookClient,
    buffer: CodexEventBuffer,
}

impl EventPersistenceWorker {
    pub fn new(webhook: WebhookClient) -> Self {
        Self {
            webhook,
            buffer: CodexEventBuffer::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<QueueItem>) {
        info!("event persistence worker started");
        loop {
            let item = match tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await {
                Err(_) => {
                    // No new event; an aged codex buffer may still need a flush.
                    self.maybe_flush();
                    continue;
                }
                Ok(None) => break,
                Ok(Some(item)) => item,
            };
            match item {
                QueueItem::Shutdown => {
                    self.flush();
                    break;
                }
                QueueItem::Event(event) => {
                    self.dispatch(event);
                    self.maybe_flush();
                }
            }
        }
        info!("event persistence worker stopped");
    }

    fn dispatch(&mut self, event: PersistableEvent) {
        if event.kind == EventKind::CodexEvent {
            self.buffer.add(codex_item_from_record(&event.data));
        } else {
            // Fire-and-forget; publish retries internally and drops on failure.
            let _ = self.webhook.publish(event.kind, event.data);
        }
    }

    fn maybe_flush(&mut self) {
        if self.buffer.should_flush() {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let events = self.buffer.take();
        if events.is_empty() {
            return;
        }
        debug!("flushing {} codex events in bulk", events.len());
        let _ = self.webhook.publish_codex_events_bulk(events);
    }
}

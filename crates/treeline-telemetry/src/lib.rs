//! Treeline Telemetry - best-effort event persistence via webhooks.
//!
//! Producers enqueue events through a non-blocking emitter; a single drain
//! task batches Codex events and dispatches everything else per-kind to the
//! webhook receiver.

pub mod artifacts;
pub mod hw;
pub mod queue;
pub mod webhook;

pub use artifacts::{ArtifactSpec, ArtifactUploader, Packaging};
pub use queue::{EventEmitter, EventPersistenceWorker, EventQueue, QueueItem};
pub use webhook::{CodexEventItem, PostError, Transport, WebhookClient};

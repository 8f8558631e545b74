//! Publishable stage state and the operator skip-request protocol.
//!
//! Operators publish skip requests through an external control channel; the
//! stage manager is the single consumer of `consume_skip_request`.

use crate::registry::ExecutionRegistry;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use treeline_core::StageIdentifier;

#[derive(Clone, Debug, Serialize)]
pub struct StageState {
    pub stage_name: Option<String>,
    pub stage_number: Option<u32>,
    pub can_be_skipped: bool,
    pub cannot_skip_reason: Option<String>,
    pub skip_pending: bool,
    pub skip_reason: Option<String>,
    pub updated_at: f64,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            stage_name: None,
            stage_number: None,
            can_be_skipped: false,
            cannot_skip_reason: Some("Stage not started".to_string()),
            skip_pending: false,
            skip_reason: None,
            updated_at: now_epoch(),
        }
    }
}

#[derive(Clone, Debug)]
struct SkipRequest {
    stage: String,
    reason: String,
    #[allow(dead_code)]
    requested_at: f64,
}

#[derive(Default)]
struct Inner {
    state: StageState,
    request: Option<SkipRequest>,
}

/// Process-wide mutable stage-control state, shared via `Arc`.
#[derive(Default)]
pub struct StageControl {
    inner: Mutex<Inner>,
}

impl StageControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_stage_state(&self) {
        let mut inner = self.lock();
        inner.state = StageState::default();
        inner.request = None;
        info!("stage control state reset");
    }

    pub fn clear_stage_state(&self) {
        self.reset_stage_state();
    }

    /// Update the currently running stage along with its skip eligibility.
    /// A stage change discards any stale pending skip request.
    pub fn publish_stage_state(
        &self,
        stage_name: &str,
        stage_number: u32,
        can_be_skipped: bool,
        cannot_skip_reason: Option<&str>,
    ) {
        let mut inner = self.lock();
        let stage_changed = inner
            .state
            .stage_name
            .as_deref()
            .map(|current| current != stage_name)
            .unwrap_or(false);
        if stage_changed {
            inner.request = None;
            inner.state.skip_pending = false;
            inner.state.skip_reason = None;
            info!(
                "stage changed to {}; cleared pending skip request",
                stage_name
            );
        }
        inner.state.stage_name = Some(stage_name.to_string());
        inner.state.stage_number = Some(stage_number);
        inner.state.can_be_skipped = can_be_skipped;
        inner.state.cannot_skip_reason = if can_be_skipped {
            None
        } else {
            Some(
                cannot_skip_reason
                    .unwrap_or("Stage cannot be skipped yet.")
                    .to_string(),
            )
        };
        inner.state.updated_at = now_epoch();
    }

    /// Request the currently running stage to be skipped. Returns
    /// `(ok, message)`; duplicates for the same stage are idempotent.
    pub fn request_stage_skip(&self, reason: Option<&str>) -> (bool, String) {
        let mut inner = self.lock();
        let Some(stage_name) = inner.state.stage_name.clone() else {
            info!("skip request rejected: no active stage");
            return (false, "No active stage to skip.".to_string());
        };
        if !inner.state.can_be_skipped {
            let blocking = inner
                .state
                .cannot_skip_reason
                .clone()
                .unwrap_or_else(|| "Stage cannot be skipped yet.".to_string());
            info!("skip request rejected for stage={}: {}", stage_name, blocking);
            return (false, blocking);
        }
        if inner
            .request
            .as_ref()
            .map(|r| r.stage == stage_name)
            .unwrap_or(false)
        {
            info!("skip already pending for stage={}", stage_name);
            return (
                true,
                format!("Skip already requested for stage {}.", stage_name),
            );
        }
        let reason = reason
            .unwrap_or("Stage skip requested by operator.")
            .to_string();
        inner.request = Some(SkipRequest {
            stage: stage_name.clone(),
            reason: reason.clone(),
            requested_at: now_epoch(),
        });
        inner.state.skip_pending = true;
        inner.state.skip_reason = Some(reason.clone());
        info!("skip request accepted for stage={} reason={}", stage_name, reason);
        (true, format!("Skip requested for stage {}.", stage_name))
    }

    /// Single-consumer: return and clear the pending reason iff the request
    /// targets the given stage.
    pub fn consume_skip_request(&self, stage_name: &str) -> Option<String> {
        let mut inner = self.lock();
        let matches = inner
            .request
            .as_ref()
            .map(|r| r.stage == stage_name)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        let reason = inner
            .request
            .take()
            .map(|r| r.reason)
            .unwrap_or_else(|| "Stage skip requested.".to_string());
        inner.state.skip_pending = false;
        inner.state.skip_reason = None;
        info!("skip request consumed for stage={} reason={}", stage_name, reason);
        Some(reason)
    }

    /// Read-only snapshot for diagnostics and the worker's skip pre-check.
    pub fn get_stage_state(&self) -> StageState {
        self.lock().state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Helper binding a stage identifier to the shared control state and the
/// execution registry.
pub struct StageSkipCoordinator {
    control: Arc<StageControl>,
    registry: Arc<ExecutionRegistry>,
    stage_identifier: StageIdentifier,
}

impl StageSkipCoordinator {
    pub fn new(
        control: Arc<StageControl>,
        registry: Arc<ExecutionRegistry>,
        stage_identifier: StageIdentifier,
    ) -> Self {
        Self {
            control,
            registry,
            stage_identifier,
        }
    }

    pub fn stage_name(&self) -> String {
        self.stage_identifier.prefixed_name()
    }

    /// Consume any pending skip request for this stage: `(is_skip, reason)`.
    pub fn consume_pending_request(&self) -> (bool, Option<String>) {
        match self.control.consume_skip_request(&self.stage_name()) {
            Some(reason) => (true, Some(reason)),
            None => (false, None),
        }
    }

    /// Mark executions for skip so workers exit early.
    pub fn flag_executions_for_skip<'a>(
        &self,
        execution_ids: impl IntoIterator<Item = &'a str>,
        reason: &str,
    ) -> usize {
        let mut count = 0;
        for execution_id in execution_ids {
            if execution_id.is_empty() {
                continue;
            }
            self.registry.flag_skip_pending(execution_id, reason);
            count += 1;
        }
        if count > 0 {
            info!(
                "flagged {} active execution(s) for skip in stage {} (reason={})",
                count,
                self.stage_name(),
                reason
            );
        }
        count
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

//! Execution registry: the authoritative map from execution id to node,
//! status, reported Codex PID, and pending-skip flag.
//!
//! Workers hold only the execution id; all cross-task mutations are atomic
//! writes of a single key.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use treeline_core::Node;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryStatus {
    Running,
    Terminated,
    Completed,
}

#[derive(Clone, Debug)]
pub struct ExecutionEntry {
    pub node_id: String,
    pub node: Option<Node>,
    pub status: RegistryStatus,
    pub payload: Option<String>,
}

#[derive(Clone, Debug)]
struct PidRecord {
    pid: u32,
    #[allow(dead_code)]
    reported_at: f64,
}

/// Result of the atomic pre-kill handshake.
#[derive(Clone, Debug)]
pub enum TerminationOutcome {
    NotFound,
    Conflict,
    Ok { pid: u32, node: Option<Node> },
}

#[derive(Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<String, ExecutionEntry>>,
    pids: DashMap<String, PidRecord>,
    skip_flags: DashMap<String, String>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_execution(&self, execution_id: &str, node: Option<&Node>) {
        let entry = ExecutionEntry {
            node_id: node
                .map(|n| n.id.clone())
                .unwrap_or_else(|| execution_id.to_string()),
            node: node.cloned(),
            status: RegistryStatus::Running,
            payload: None,
        };
        self.lock_entries()
            .insert(execution_id.to_string(), entry);
        info!(
            "registered execution_id={} for node={}",
            execution_id,
            node.map(|n| n.id.as_str()).unwrap_or("standalone"),
        );
    }

    /// Record the Codex child PID; called by the worker once the process is
    /// spawned.
    pub fn update_pid(&self, execution_id: &str, pid: u32) {
        self.pids.insert(
            execution_id.to_string(),
            PidRecord {
                pid,
                reported_at: now_epoch(),
            },
        );
        info!("recorded pid={} for execution_id={}", pid, execution_id);
    }

    pub fn clear_pid(&self, execution_id: &str) {
        self.pids.remove(execution_id);
        debug!("cleared pid for execution_id={}", execution_id);
    }

    pub fn get_pid(&self, execution_id: &str) -> Option<u32> {
        self.pids.get(execution_id).map(|r| r.pid)
    }

    pub fn mark_completed(&self, execution_id: &str) {
        if let Some(entry) = self.lock_entries().get_mut(execution_id) {
            entry.status = RegistryStatus::Completed;
            info!("marked execution_id={} as completed", execution_id);
        }
        self.clear_pid(execution_id);
    }

    /// Mark terminated and carry the user-feedback payload onto the stored
    /// node snapshot so the agent can graft it onto the rebuilt node.
    pub fn mark_terminated(&self, execution_id: &str, payload: &str) -> Option<Node> {
        let mut entries = self.lock_entries();
        let entry = entries.get_mut(execution_id)?;
        entry.status = RegistryStatus::Terminated;
        entry.payload = Some(payload.to_string());
        if let Some(node) = entry.node.as_mut() {
            node.is_user_feedback = true;
            node.user_feedback_payload = Some(payload.to_string());
            node.user_feedback_pending = true;
            info!(
                "execution_id={} terminated; node {} now pending user feedback",
                execution_id, node.id
            );
        } else {
            info!(
                "execution_id={} terminated without node reference",
                execution_id
            );
        }
        entry.node.clone()
    }

    pub fn get_entry(&self, execution_id: &str) -> Option<ExecutionEntry> {
        self.lock_entries().get(execution_id).cloned()
    }

    pub fn clear_execution(&self, execution_id: &str) {
        self.lock_entries().remove(execution_id);
        self.clear_pid(execution_id);
        self.skip_flags.remove(execution_id);
        debug!("cleared execution registry entry for {}", execution_id);
    }

    pub fn has_active_execution(&self, execution_id: &str) -> bool {
        self.lock_entries()
            .get(execution_id)
            .map(|e| e.status == RegistryStatus::Running)
            .unwrap_or(false)
    }

    /// Record a pending skip; workers poll this before the Codex spawn and
    /// before the metrics pass.
    pub fn flag_skip_pending(&self, execution_id: &str, reason: &str) {
        self.skip_flags
            .insert(execution_id.to_string(), reason.to_string());
        info!(
            "flagged execution_id={} for skip (reason={})",
            execution_id, reason
        );
    }

    pub fn is_skip_pending(&self, execution_id: &str) -> Option<String> {
        self.skip_flags.get(execution_id).map(|r| r.clone())
    }

    /// Atomic pre-kill handshake. On `Ok` the entry is already marked
    /// terminated and the caller owns delivery of the SIGTERM.
    pub fn begin_termination(&self, execution_id: &str, payload: &str) -> TerminationOutcome {
        {
            let entries = self.lock_entries();
            match entries.get(execution_id) {
                None => {
                    warn!("termination requested for unknown execution_id={}", execution_id);
                    return TerminationOutcome::NotFound;
                }
                Some(entry) if entry.status != RegistryStatus::Running => {
                    warn!(
                        "termination requested but execution already {:?} for execution_id={}",
                        entry.status, execution_id
                    );
                    return TerminationOutcome::Conflict;
                }
                Some(_) => {}
            }
        }
        let Some(pid) = self.get_pid(execution_id) else {
            warn!(
                "termination requested but PID missing for execution_id={}; marking conflict",
                execution_id
            );
            return TerminationOutcome::Conflict;
        };
        let node = self.mark_terminated(execution_id, payload);
        info!(
            "termination handshake ready for execution_id={} with pid={}",
            execution_id, pid
        );
        TerminationOutcome::Ok { pid, node }
    }

    /// Used by the Codex runner's termination checker.
    pub fn is_terminated(&self, execution_id: &str) -> bool {
        self.lock_entries()
            .get(execution_id)
            .map(|e| e.status == RegistryStatus::Terminated)
            .unwrap_or(false)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ExecutionEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

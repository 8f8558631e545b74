//! Structured telemetry events.
//!
//! Every event can be emitted locally (tracing fallback); events that carry a
//! persistence record are additionally forwarded to the webhook publisher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Webhook event kinds. Each maps to a per-run endpoint on the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStageProgress,
    RunLog,
    StageCompleted,
    StageSummary,
    SubstageCompleted,
    SubstageSummary,
    PaperGenerationProgress,
    TreeVizStored,
    RunningCode,
    RunCompleted,
    StageSkipWindow,
    ArtifactUploaded,
    ReviewCompleted,
    CodexEvent,
    TokenUsage,
    FigureReviews,
    BestNodeSelected,
}

/// Execution stream identifier for code-execution telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    CodexExecution,
    RunfileExecution,
}

/// What the code execution is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    StageGoal,
    Seed,
    Aggregation,
    Metrics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageProgressPayload {
    pub stage: String,
    pub iteration: usize,
    pub max_iterations: usize,
    pub progress: f64,
    pub total_nodes: usize,
    pub buggy_nodes: usize,
    pub good_nodes: usize,
    pub best_metric: Option<String>,
    pub is_seed_node: bool,
    pub is_seed_agg_node: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunLogPayload {
    pub message: String,
    pub level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodexEventPayload {
    pub stage: String,
    pub node: usize,
    pub event_type: String,
    pub event_content: String,
    /// RFC 3339 timestamp.
    pub occurred_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageCompletedPayload {
    pub stage: String,
    pub main_stage_number: u32,
    pub reason: String,
    pub summary: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubstageSummaryPayload {
    pub stage: String,
    pub summary: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaperGenerationProgressPayload {
    pub step: String,
    pub substep: Option<String>,
    pub progress: f64,
    pub step_progress: f64,
    pub details: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeVizStoredPayload {
    pub stage: String,
    pub tree: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunningCodePayload {
    pub execution_id: String,
    pub stage: String,
    pub run_type: RunType,
    pub execution_type: ExecutionType,
    pub code: String,
    pub started_at: String,
    pub is_seed_node: bool,
    pub is_seed_agg_node: bool,
    /// 1-based node index for display.
    pub node_index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub execution_id: String,
    pub stage: String,
    pub run_type: RunType,
    pub execution_type: ExecutionType,
    pub status: RunStatus,
    pub exec_time: f64,
    pub completed_at: String,
    pub is_seed_node: bool,
    pub is_seed_agg_node: bool,
    pub node_index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipWindowState {
    Opened,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageSkipWindowPayload {
    pub stage: String,
    pub state: SkipWindowState,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactUploadedPayload {
    pub artifact_type: String,
    pub s3_key: String,
    pub filename: String,
    pub metadata: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenUsagePayload {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BestNodeSelectedPayload {
    pub stage: String,
    pub node_id: String,
    pub reasoning: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuShortagePayload {
    pub required_gpus: usize,
    pub available_gpus: usize,
    pub message: String,
}

/// A kind + payload pair ready for webhook publication.
#[derive(Clone, Debug)]
pub struct PersistableEvent {
    pub kind: EventKind,
    pub data: Value,
}

/// Typed union of everything the engine can emit.
#[derive(Clone, Debug)]
pub enum TimelineEvent {
    RunStageProgress(StageProgressPayload),
    RunLog(RunLogPayload),
    StageCompleted(StageCompletedPayload),
    SubstageCompleted(StageCompletedPayload),
    SubstageSummary(SubstageSummaryPayload),
    PaperGenerationProgress(PaperGenerationProgressPayload),
    TreeVizStored(TreeVizStoredPayload),
    RunningCode(RunningCodePayload),
    RunCompleted(RunCompletedPayload),
    StageSkipWindow(StageSkipWindowPayload),
    ArtifactUploaded(ArtifactUploadedPayload),
    ReviewCompleted(Value),
    CodexEvent(CodexEventPayload),
    TokenUsage(TokenUsagePayload),
    FigureReviews(Vec<Value>),
    BestNodeSelected(BestNodeSelectedPayload),
    /// Fatal resource shortage; published through a dedicated webhook helper
    /// rather than the event queue.
    GpuShortage(GpuShortagePayload),
}

impl TimelineEvent {
    pub fn run_log(message: impl Into<String>, level: &str) -> Self {
        TimelineEvent::RunLog(RunLogPayload {
            message: message.into(),
            level: level.to_string(),
        })
    }

    /// Tracing label, used by the local fallback logger.
    pub fn kind_label(&self) -> &'static str {
        match self {
            TimelineEvent::RunStageProgress(_) => "ai.run.stage_progress",
            TimelineEvent::RunLog(_) => "ai.run.log",
            TimelineEvent::StageCompleted(_) => "ai.run.stage_completed",
            TimelineEvent::SubstageCompleted(_) => "ai.run.substage_completed",
            TimelineEvent::SubstageSummary(_) => "ai.run.substage_summary",
            TimelineEvent::PaperGenerationProgress(_) => "ai.run.paper_generation_progress",
            TimelineEvent::TreeVizStored(_) => "ai.run.tree_viz_stored",
            TimelineEvent::RunningCode(_) => "ai.run.running_code",
            TimelineEvent::RunCompleted(_) => "ai.run.run_completed",
            TimelineEvent::StageSkipWindow(_) => "ai.run.stage_skip_window",
            TimelineEvent::ArtifactUploaded(_) => "ai.run.artifact_uploaded",
            TimelineEvent::ReviewCompleted(_) => "ai.run.review_completed",
            TimelineEvent::CodexEvent(_) => "ai.codex.event",
            TimelineEvent::TokenUsage(_) => "ai.run.token_usage",
            TimelineEvent::FigureReviews(_) => "ai.run.figure_reviews",
            TimelineEvent::BestNodeSelected(_) => "ai.run.best_node_selected",
            TimelineEvent::GpuShortage(_) => "ai.run.gpu_shortage",
        }
    }

    /// Structured payload for webhook persistence; None for emit-only events.
    pub fn persistence_record(&self) -> Option<PersistableEvent> {
        let (kind, data) = match self {
            TimelineEvent::RunStageProgress(p) => {
                (EventKind::RunStageProgress, serde_json::to_value(p))
            }
            TimelineEvent::RunLog(p) => (EventKind::RunLog, serde_json::to_value(p)),
            TimelineEvent::StageCompleted(p) => {
                (EventKind::StageCompleted, serde_json::to_value(p))
            }
            TimelineEvent::SubstageCompleted(p) => {
                (EventKind::SubstageCompleted, serde_json::to_value(p))
            }
            TimelineEvent::SubstageSummary(p) => {
                (EventKind::SubstageSummary, serde_json::to_value(p))
            }
            TimelineEvent::PaperGenerationProgress(p) => {
                (EventKind::PaperGenerationProgress, serde_json::to_value(p))
            }
            TimelineEvent::TreeVizStored(p) => (EventKind::TreeVizStored, serde_json::to_value(p)),
            TimelineEvent::RunningCode(p) => (EventKind::RunningCode, serde_json::to_value(p)),
            TimelineEvent::RunCompleted(p) => (EventKind::RunCompleted, serde_json::to_value(p)),
            TimelineEvent::StageSkipWindow(p) => {
                (EventKind::StageSkipWindow, serde_json::to_value(p))
            }
            TimelineEvent::ArtifactUploaded(p) => {
                (EventKind::ArtifactUploaded, serde_json::to_value(p))
            }
            TimelineEvent::ReviewCompleted(p) => {
                (EventKind::ReviewCompleted, Ok(p.clone()))
            }
            TimelineEvent::CodexEvent(p) => (EventKind::CodexEvent, serde_json::to_value(p)),
            TimelineEvent::TokenUsage(p) => (EventKind::TokenUsage, serde_json::to_value(p)),
            TimelineEvent::FigureReviews(p) => {
                (EventKind::FigureReviews, serde_json::to_value(p))
            }
            TimelineEvent::BestNodeSelected(p) => {
                (EventKind::BestNodeSelected, serde_json::to_value(p))
            }
            TimelineEvent::GpuShortage(_) => return None,
        };
        let data = data.ok()?;
        Some(PersistableEvent { kind, data })
    }

    /// One-line description for the local fallback logger.
    pub fn summary(&self) -> String {
        match self {
            TimelineEvent::RunLog(p) => format!("[{}] {}", p.level, p.message),
            TimelineEvent::RunStageProgress(p) => format!(
                "stage={} iter={}/{} progress={:.2}",
                p.stage, p.iteration, p.max_iterations, p.progress
            ),
            TimelineEvent::RunningCode(p) => {
                format!("execution_id={} stage={}", p.execution_id, p.stage)
            }
            TimelineEvent::RunCompleted(p) => format!(
                "execution_id={} stage={} status={:?}",
                p.execution_id, p.stage, p.status
            ),
            TimelineEvent::CodexEvent(p) => format!("stage={} type={}", p.stage, p.event_type),
            other => other.kind_label().to_string(),
        }
    }
}

//! Shared engine types: worker task inputs and stage ideas.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use treeline_core::{Config, StageIdentifier, TaskDescription};

/// The run-wide evaluation metric specification, defined once per agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationMetricSpec {
    pub name: String,
    pub maximize: bool,
    pub description: String,
}

impl EvaluationMetricSpec {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "maximize": self.maximize,
            "description": self.description,
        })
    }
}

/// A Stage 2 hyperparameter idea or Stage 4 ablation idea assigned to one
/// node attempt, with the names already tried for diversity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageIdea {
    pub name: String,
    pub description: String,
    pub tried_names: Vec<String>,
}

/// Seed-node snapshots handed to the aggregation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedAggregationPayload {
    pub seed_nodes: Vec<Value>,
}

/// Everything a worker needs for one dispatched node attempt.
#[derive(Clone)]
pub struct NodeTask {
    /// Serialized parent node; None for a fresh draft.
    pub parent_snapshot: Option<Value>,
    pub task_desc: TaskDescription,
    pub curated_task_desc: String,
    pub stage_goals: String,
    pub evaluation_metric: EvaluationMetricSpec,
    pub cfg: Config,
    pub memory_summary: String,
    pub stage_identifier: StageIdentifier,
    pub seed_eval: bool,
    pub seed_value: u32,
    pub seed_aggregation: Option<SeedAggregationPayload>,
    pub hyperparam_idea: Option<StageIdea>,
    pub ablation_idea: Option<StageIdea>,
    pub gpu_id: Option<usize>,
    pub execution_id: String,
    pub user_feedback_payload: String,
    /// 1-based index for display in telemetry.
    pub node_index: usize,
}

impl NodeTask {
    pub fn stage_name(&self) -> String {
        self.stage_identifier.prefixed_name()
    }

    pub fn execution_type(&self) -> treeline_core::ExecutionType {
        if self.seed_aggregation.is_some() {
            treeline_core::ExecutionType::Aggregation
        } else if self.seed_eval {
            treeline_core::ExecutionType::Seed
        } else {
            treeline_core::ExecutionType::StageGoal
        }
    }
}

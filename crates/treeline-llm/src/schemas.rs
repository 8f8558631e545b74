//! Structured-response schemas consumed by the engine.

use crate::provider::ResponseSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A natural-language plan plus the code implementing it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanAndCodeSchema {
    pub plan: String,
    pub code: String,
}

impl ResponseSchema for PlanAndCodeSchema {
    fn schema_name() -> &'static str {
        "plan_and_code"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan": {"type": "string", "description": "Natural language plan for the experiment"},
                "code": {"type": "string", "description": "Complete Python code implementing the plan"}
            },
            "required": ["plan", "code"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuUsageValidationSchema {
    pub uses_gpu: bool,
    pub reasoning: String,
}

impl ResponseSchema for GpuUsageValidationSchema {
    fn schema_name() -> &'static str {
        "gpu_usage_validation"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "uses_gpu": {"type": "boolean", "description": "True if the code moves the workload to a GPU"},
                "reasoning": {"type": "string"}
            },
            "required": ["uses_gpu", "reasoning"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricDataPoint {
    /// Dataset name without 'train'/'val'/'test' suffixes.
    pub dataset_name: String,
    pub final_value: f64,
    pub best_value: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricInfo {
    pub metric_name: String,
    pub lower_is_better: bool,
    pub description: String,
    pub data: Vec<MetricDataPoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricParseResponse {
    pub valid_metrics_received: bool,
    pub metric_names: Vec<MetricInfo>,
}

impl ResponseSchema for MetricParseResponse {
    fn schema_name() -> &'static str {
        "metric_parse_response"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "valid_metrics_received": {
                    "type": "boolean",
                    "description": "True if any metrics were parsed from the execution output"
                },
                "metric_names": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "metric_name": {
                                "type": "string",
                                "description": "Specific metric name (e.g., 'validation accuracy', 'BLEU-4'); avoid vague labels like 'train' or 'test'."
                            },
                            "lower_is_better": {"type": "boolean"},
                            "description": {"type": "string"},
                            "data": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "dataset_name": {
                                            "type": "string",
                                            "description": "Dataset name without 'train', 'val', or 'test' suffixes."
                                        },
                                        "final_value": {"type": "number"},
                                        "best_value": {"type": "number"}
                                    },
                                    "required": ["dataset_name", "final_value", "best_value"]
                                }
                            }
                        },
                        "required": ["metric_name", "lower_is_better", "description", "data"]
                    }
                }
            },
            "required": ["valid_metrics_received", "metric_names"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlotAnalysisEntry {
    pub analysis: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlotFeedback {
    pub plot_analyses: Vec<PlotAnalysisEntry>,
    /// False when the plots are empty, corrupted, or non-diagnostic.
    pub valid_plots_received: bool,
    pub vlm_feedback_summary: String,
}

impl ResponseSchema for PlotFeedback {
    fn schema_name() -> &'static str {
        "plot_feedback"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "plot_analyses": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "analysis": {
                                "type": "string",
                                "description": "Detailed analysis of the plot's implications and scientific insight."
                            }
                        },
                        "required": ["analysis"]
                    }
                },
                "valid_plots_received": {
                    "type": "boolean",
                    "description": "True if the provided plots were meaningful."
                },
                "vlm_feedback_summary": {
                    "type": "string",
                    "description": "High-level summary of the vision-language model feedback."
                }
            },
            "required": ["plot_analyses", "valid_plots_received", "vlm_feedback_summary"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlotSelectionResponse {
    /// Full paths of up to 10 plots, ordered by importance.
    pub selected_plots: Vec<String>,
}

impl ResponseSchema for PlotSelectionResponse {
    fn schema_name() -> &'static str {
        "plot_selection_response"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "selected_plots": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Full paths of up to 10 plots that best capture results (ordered by importance)."
                }
            },
            "required": ["selected_plots"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingReview {
    /// True if the output log shows a failure or bug.
    pub is_bug: bool,
    pub summary: String,
}

impl ResponseSchema for TrainingReview {
    fn schema_name() -> &'static str {
        "training_review"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "is_bug": {
                    "type": "boolean",
                    "description": "True if the output log shows a failure or bug; False when execution succeeded."
                },
                "summary": {
                    "type": "string",
                    "description": "If is_bug=true, summarize the failure and propose a fix."
                }
            },
            "required": ["is_bug", "summary"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub findings: String,
    pub significance: String,
    pub next_steps: Option<String>,
}

impl ResponseSchema for ExperimentSummary {
    fn schema_name() -> &'static str {
        "experiment_summary"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "findings": {"type": "string", "description": "Key experimental findings/outcomes."},
                "significance": {"type": "string", "description": "Why the findings matter."},
                "next_steps": {"type": "string"}
            },
            "required": ["findings", "significance"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageCompletionEvaluation {
    pub is_complete: bool,
    pub reasoning: String,
    pub missing_criteria: Vec<String>,
}

impl ResponseSchema for StageCompletionEvaluation {
    fn schema_name() -> &'static str {
        "stage_completion_evaluation"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "is_complete": {"type": "boolean"},
                "reasoning": {"type": "string"},
                "missing_criteria": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["is_complete", "reasoning", "missing_criteria"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSelectionResponse {
    pub selected_id: String,
    pub reasoning: String,
}

impl ResponseSchema for NodeSelectionResponse {
    fn schema_name() -> &'static str {
        "node_selection_response"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "selected_id": {"type": "string", "description": "The id of the best candidate implementation"},
                "reasoning": {"type": "string"}
            },
            "required": ["selected_id", "reasoning"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HyperparamTuningIdea {
    /// Short name identifying which hyperparameter is being tuned.
    pub name: String,
    pub description: String,
}

impl ResponseSchema for HyperparamTuningIdea {
    fn schema_name() -> &'static str {
        "hyperparam_tuning_idea"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "A short, descriptive name for the proposed hyperparameter tuning idea. It should clearly identify which hyperparameter is being tuned."
                },
                "description": {
                    "type": "string",
                    "description": "A brief description (3-5 sentences) of which hyperparameter is being tuned, how it will be changed, and why it is expected to help."
                }
            },
            "required": ["name", "description"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AblationIdea {
    /// Short name identifying which component is being ablated.
    pub name: String,
    pub description: String,
}

impl ResponseSchema for AblationIdea {
    fn schema_name() -> &'static str {
        "ablation_idea"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "A short, descriptive name for the proposed ablation study. It should clearly identify which component is being removed or replaced."
                },
                "description": {
                    "type": "string",
                    "description": "A brief description (3-5 sentences) of what is being ablated and what the study is expected to reveal."
                }
            },
            "required": ["name", "description"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationMetricSpecResponse {
    pub name: String,
    pub maximize: bool,
    pub description: String,
}

impl ResponseSchema for EvaluationMetricSpecResponse {
    fn schema_name() -> &'static str {
        "evaluation_metric_spec"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The name of the metric"},
                "maximize": {"type": "boolean", "description": "Whether higher values are better"},
                "description": {"type": "string", "description": "What the metric measures"}
            },
            "required": ["name", "maximize", "description"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubstageGoalResponse {
    pub goals: String,
}

impl ResponseSchema for SubstageGoalResponse {
    fn schema_name() -> &'static str {
        "substage_goal_response"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "goals": {"type": "string", "description": "Specific, actionable goals for the next sub-stage"}
            },
            "required": ["goals"]
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionSummaryResponse {
    pub summary: String,
}

impl ResponseSchema for TransitionSummaryResponse {
    fn schema_name() -> &'static str {
        "transition_summary_response"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "Narrative summary of the completed stage for the next one"}
            },
            "required": ["summary"]
        })
    }
}

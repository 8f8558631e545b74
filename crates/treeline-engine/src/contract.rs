//! The node-result contract: what Codex must (and must not) write into
//! `node_result.json`.
//!
//! Each rule exists twice: as prompt lines embedded into the task markdown,
//! and as a validator that turns violations into a buggy node.

use serde_json::Value;
use std::path::Path;
use treeline_core::StageIdentifier;

/// Keys a node_result.json may carry: the node's serialized fields plus the
/// relationship ids of the serialized tree form.
const ALLOWED_KEYS: &[&str] = &[
    "id",
    "step",
    "ctime",
    "parent",
    "parent_id",
    "children",
    "plan",
    "code",
    "plot_code",
    "term_out",
    "exec_time",
    "exc_type",
    "exc_info",
    "parse_metrics_code",
    "analysis",
    "metric",
    "is_buggy",
    "is_buggy_plots",
    "best_node_reasoning",
    "vlm_feedback",
    "plot_analyses",
    "vlm_feedback_summary",
    "datasets_successfully_tested",
    "exec_time_feedback",
    "is_seed_node",
    "is_seed_agg_node",
    "ablation_name",
    "hyperparam_name",
    "is_user_feedback",
    "user_feedback_payload",
    "user_feedback_pending",
    "exp_results_dir",
    "plots",
    "plot_paths",
];

#[derive(Clone, Debug)]
pub struct ContractContext {
    pub stage_identifier: StageIdentifier,
    pub is_seed_aggregation: bool,
    pub seed_eval: bool,
    pub seed_value: u32,
    pub working_png_count: usize,
    pub expected_hyperparam_name: Option<String>,
    pub expected_ablation_name: Option<String>,
}

pub fn count_working_pngs(working_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(working_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map(|x| x.eq_ignore_ascii_case("png"))
                .unwrap_or(false)
        })
        .count()
}

fn is_non_empty_string(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

fn is_list_of_strings(value: &Value) -> bool {
    value
        .as_array()
        .map(|items| items.iter().all(Value::is_string))
        .unwrap_or(false)
}

/// Rules every node_result must satisfy regardless of stage.
pub fn validate_common(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = node_result.as_object() else {
        return vec!["node_result.json must be a JSON object".to_string()];
    };

    let mut extras: Vec<String> = obj
        .keys()
        .filter(|k| !ALLOWED_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    extras.sort();
    if !extras.is_empty() {
        errors.push(format!(
            "Unexpected key(s) in node_result.json: {:?}. Remove them.",
            extras
        ));
    }

    // Harness-owned field: Codex must not provide it.
    if obj.contains_key("metric") {
        errors.push("Do NOT include metric in node_result.json".to_string());
    }
    if !obj.get("is_buggy_plots").map(Value::is_boolean).unwrap_or(false) {
        errors.push("is_buggy_plots must be a boolean (true/false)".to_string());
    }
    if let Some(v) = obj.get("is_seed_agg_node") {
        if !v.is_boolean() {
            errors.push("is_seed_agg_node must be a boolean".to_string());
        }
    }
    let is_seed_agg = obj.get("is_seed_agg_node").and_then(Value::as_bool);
    if ctx.is_seed_aggregation {
        if is_seed_agg != Some(true) {
            errors.push("seed aggregation run requires is_seed_agg_node=true".to_string());
        }
    } else if is_seed_agg == Some(true) {
        errors.push("non-aggregation run requires is_seed_agg_node=false".to_string());
    }

    match obj.get("datasets_successfully_tested") {
        None => errors.push("datasets_successfully_tested is required (use [] if none)".to_string()),
        Some(v) if !is_list_of_strings(v) => {
            errors.push("datasets_successfully_tested must be a list of strings".to_string())
        }
        _ => {}
    }

    if ctx.seed_eval {
        if obj.get("is_seed_node").and_then(Value::as_bool) != Some(true) {
            errors.push("seed_eval=true requires is_seed_node=true".to_string());
        }
        match obj.get("plan").and_then(Value::as_str) {
            Some(plan) => {
                let seed_text = ctx.seed_value.to_string();
                if !plan.to_lowercase().contains("seed") || !plan.contains(&seed_text) {
                    errors.push(format!(
                        "seed_eval=true requires the plan to mention the seed value (expected {})",
                        ctx.seed_value
                    ));
                }
            }
            None => errors.push(
                "plan must be a string (and must mention the seed when seed_eval=true)".to_string(),
            ),
        }
    }

    errors
}

fn validate_stage2(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = Vec::new();
    let name = node_result.get("hyperparam_name");
    if !is_non_empty_string(name) {
        errors.push("Stage2 requires hyperparam_name to be a non-empty string".to_string());
    }
    if let Some(expected) = &ctx.expected_hyperparam_name {
        let actual = name.and_then(Value::as_str).unwrap_or("");
        if actual != expected {
            errors.push(format!(
                "Stage2 requires hyperparam_name={:?} (got {:?}); set it exactly to the assigned idea name",
                expected, actual
            ));
        }
    }
    errors
}

fn validate_stage3(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = Vec::new();
    if node_result.get("is_buggy_plots").and_then(Value::as_bool) == Some(false)
        && ctx.working_png_count == 0
    {
        errors.push(
            "Stage3 requires at least one .png in ./working when is_buggy_plots=false".to_string(),
        );
    }
    errors
}

fn validate_stage4(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = Vec::new();
    let name = node_result.get("ablation_name");
    if !is_non_empty_string(name) {
        errors.push("Stage4 requires ablation_name to be a non-empty string".to_string());
    }
    if let Some(expected) = &ctx.expected_ablation_name {
        let actual = name.and_then(Value::as_str).unwrap_or("");
        if actual != expected {
            errors.push(format!(
                "Stage4 requires ablation_name={:?} (got {:?}); set it exactly to the assigned idea name",
                expected, actual
            ));
        }
    }
    if node_result.get("is_buggy_plots").and_then(Value::as_bool) == Some(false) {
        if ctx.working_png_count == 0 {
            errors.push(
                "Stage4 requires at least one .png in ./working when is_buggy_plots=false"
                    .to_string(),
            );
        }
        let analyses_ok = node_result
            .get("plot_analyses")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !analyses_ok {
            errors.push("Stage4 requires non-empty plot_analyses when is_buggy_plots=false".to_string());
        }
        let summary_ok = node_result
            .get("vlm_feedback_summary")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .any(|v| v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false))
            })
            .unwrap_or(false);
        if !summary_ok {
            errors.push(
                "Stage4 requires vlm_feedback_summary to contain at least one non-empty string"
                    .to_string(),
            );
        }
    }
    errors
}

fn validate_seed_aggregation(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = Vec::new();
    if node_result.get("is_seed_node").and_then(Value::as_bool) != Some(true) {
        errors.push("seed aggregation requires is_seed_node=true".to_string());
    }
    if node_result.get("is_seed_agg_node").and_then(Value::as_bool) != Some(true) {
        errors.push("seed aggregation requires is_seed_agg_node=true".to_string());
    }
    if !is_non_empty_string(node_result.get("analysis")) {
        errors.push("seed aggregation requires analysis to be a non-empty string".to_string());
    }
    if node_result.get("is_buggy_plots").and_then(Value::as_bool) == Some(false)
        && ctx.working_png_count == 0
    {
        errors.push(
            "seed aggregation requires at least one .png in ./working when is_buggy_plots=false"
                .to_string(),
        );
    }
    errors
}

/// Full validation: common rules, then seed-aggregation or per-stage rules.
pub fn validate_node_result(node_result: &Value, ctx: &ContractContext) -> Vec<String> {
    let mut errors = validate_common(node_result, ctx);
    if ctx.is_seed_aggregation {
        errors.extend(validate_seed_aggregation(node_result, ctx));
        return errors;
    }
    match ctx.stage_identifier {
        StageIdentifier::Stage1 => {}
        StageIdentifier::Stage2 => errors.extend(validate_stage2(node_result, ctx)),
        StageIdentifier::Stage3 => errors.extend(validate_stage3(node_result, ctx)),
        StageIdentifier::Stage4 => errors.extend(validate_stage4(node_result, ctx)),
    }
    errors
}

pub fn common_contract_lines() -> Vec<String> {
    [
        "Write your result as a single JSON object to the output file named below.",
        "- Use only the documented node_result keys; unexpected keys are rejected.",
        "- Do NOT include `metric`: the harness computes metrics in a separate pass.",
        "- `is_buggy` and `is_buggy_plots` must be booleans reflecting the real outcome.",
        "- `is_seed_agg_node` must be false unless this is a seed-aggregation run.",
        "- `datasets_successfully_tested` is required; use [] when no dataset was exercised.",
        "- `plan` and `code` must describe exactly what you ran.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// The per-stage contract block embedded in the task markdown.
pub fn contract_lines_for_stage(stage: StageIdentifier) -> Vec<String> {
    let mut lines = common_contract_lines();
    match stage {
        StageIdentifier::Stage1 => {}
        StageIdentifier::Stage2 => {
            lines.push("- Stage-specific required fields:".to_string());
            lines.push(
                "  - Stage 2: `hyperparam_name` must be a non-empty string equal to the assigned idea name."
                    .to_string(),
            );
        }
        StageIdentifier::Stage3 => {
            lines.push("- Stage-specific required fields:".to_string());
            lines.push(
                "  - Stage 3: when `is_buggy_plots=false`, at least one .png must exist in ./working."
                    .to_string(),
            );
        }
        StageIdentifier::Stage4 => {
            lines.push("- Stage-specific required fields:".to_string());
            lines.push(
                "  - Stage 4: `ablation_name` must be a non-empty string equal to the assigned idea name."
                    .to_string(),
            );
            lines.push(
                "  - Stage 4: when `is_buggy_plots=false`, a .png must exist in ./working, `plot_analyses` must be non-empty, and `vlm_feedback_summary` must contain at least one non-empty string."
                    .to_string(),
            );
        }
    }
    lines
}

pub fn seed_aggregation_contract_lines() -> Vec<String> {
    [
        "- Seed-aggregation required fields:",
        "  - `is_seed_node` must be true and `is_seed_agg_node` must be true.",
        "  - `analysis` must be a non-empty string summarising variability across seeds.",
        "  - When `is_buggy_plots=false`, at least one .png must exist in ./working.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn seed_aggregation_instruction_lines() -> Vec<String> {
    [
        "This is a seed-aggregation run: the same experiment was executed under multiple random seeds.",
        "Aggregate the per-seed results (mean and standard error per dataset/metric) and produce",
        "comparison plots that show variability across seeds. Summarise the stability of the",
        "findings in `analysis`.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

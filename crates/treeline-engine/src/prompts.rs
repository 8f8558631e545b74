//! Prompt composition for the Codex task files.
//!
//! Rendering is plain string assembly; the per-stage contract block and the
//! seed-aggregation block are supplied by the contract module.

use crate::types::{EvaluationMetricSpec, StageIdea};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use treeline_core::StageIdentifier;

pub struct CodexTaskContext<'a> {
    pub execution_id: &'a str,
    pub stage_identifier: StageIdentifier,
    pub timeout_seconds: u64,
    pub curated_task_desc: &'a str,
    pub stage_goals: &'a str,
    pub memory_summary: &'a str,
    pub venv_dir: &'a str,
    pub environment_context: &'a Value,
    pub num_syn_datasets: u32,
    pub k_fold_validation: Option<u32>,
    pub evaluation_metric: &'a EvaluationMetricSpec,
    pub hyperparam_idea: Option<&'a StageIdea>,
    pub ablation_idea: Option<&'a StageIdea>,
    pub base_code: &'a str,
    pub parent_term_out: &'a str,
    pub parent_exc_type: &'a str,
    pub parent_analysis: &'a str,
    pub parent_vlm_feedback_summary: &'a str,
    pub exec_time_feedback: &'a str,
    pub user_feedback_payload: &'a str,
    pub seed_agg_block: &'a str,
    pub contract_block: &'a str,
    pub output_json_name: &'a str,
    pub agent_file_name: &'a str,
}

pub fn wrap_code(code: &str, lang: &str) -> String {
    format!("```{}\n{}\n```", lang, code)
}

fn push_section(out: &mut String, title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "## {}\n\n{}\n", title, body.trim_end());
}

/// Render `codex_task.md` - the single task document Codex receives.
pub fn render_codex_task_markdown(ctx: &CodexTaskContext<'_>) -> String {
    let stage_name = ctx.stage_identifier.prefixed_name();
    let mut out = String::new();
    let _ = writeln!(out, "# Experiment task ({})\n", stage_name);
    let _ = writeln!(
        out,
        "Execution id: `{}`. Wall-clock budget: {} seconds. Work inside the current \
         directory; write experiment outputs under `./working/`.\n",
        ctx.execution_id, ctx.timeout_seconds
    );

    push_section(&mut out, "Research idea", ctx.curated_task_desc);
    push_section(&mut out, "Stage goals", ctx.stage_goals);
    push_section(&mut out, "Progress so far", ctx.memory_summary);

    let mut environment = String::new();
    let _ = writeln!(
        environment,
        "- Python virtualenv: `{}` (run everything with its interpreter).",
        ctx.venv_dir
    );
    let _ = writeln!(
        environment,
        "- You may generate up to {} synthetic dataset(s) when no real dataset applies.",
        ctx.num_syn_datasets
    );
    if let Some(k) = ctx.k_fold_validation {
        let _ = writeln!(
            environment,
            "- Evaluate with {}-fold cross-validation where the dataset size allows it.",
            k
        );
    }
    if !ctx.environment_context.is_null() {
        let _ = writeln!(
            environment,
            "- Environment snapshot (best-effort):\n{}",
            wrap_code(
                &serde_json::to_string_pretty(ctx.environment_context).unwrap_or_default(),
                "json"
            )
        );
    }
    push_section(&mut out, "Environment", &environment);

    push_section(
        &mut out,
        "Evaluation metric",
        &wrap_code(
            &serde_json::to_string_pretty(&ctx.evaluation_metric.to_json()).unwrap_or_default(),
            "json",
        ),
    );

    if let Some(idea) = ctx.hyperparam_idea {
        let mut block = format!(
            "Assigned hyperparameter idea: **{}**\n\n{}\n",
            idea.name, idea.description
        );
        if !idea.tried_names.is_empty() {
            let _ = writeln!(
                block,
                "\nAlready tried (do not repeat): {}",
                idea.tried_names.join(", ")
            );
        }
        block.push_str("\nSet `hyperparam_name` in node_result.json to exactly the assigned name.");
        push_section(&mut out, "Hyperparameter tuning assignment", &block);
    }

    if let Some(idea) = ctx.ablation_idea {
        let mut block = format!(
            "Assigned ablation study: **{}**\n\n{}\n",
            idea.name, idea.description
        );
        if !idea.tried_names.is_empty() {
            let _ = writeln!(
                block,
                "\nAlready completed (do not repeat): {}",
                idea.tried_names.join(", ")
            );
        }
        block.push_str("\nSet `ablation_name` in node_result.json to exactly the assigned name.");
        push_section(&mut out, "Ablation assignment", &block);
    }

    if !ctx.base_code.trim().is_empty() {
        push_section(
            &mut out,
            "Starting implementation",
            &format!(
                "Build on the parent implementation below; overwrite `{}` with your version.\n\n{}",
                ctx.agent_file_name,
                wrap_code(ctx.base_code, "python")
            ),
        );
    } else {
        push_section(
            &mut out,
            "Starting implementation",
            &format!(
                "This is a fresh draft. Write your implementation into `{}`; `example_code.py` \
                 shows the expected shape.",
                ctx.agent_file_name
            ),
        );
    }

    let mut parent_feedback = String::new();
    if !ctx.parent_exc_type.is_empty() {
        let _ = writeln!(parent_feedback, "Previous exception type: {}", ctx.parent_exc_type);
    }
    if !ctx.parent_analysis.is_empty() {
        let _ = writeln!(parent_feedback, "Previous analysis:\n{}", ctx.parent_analysis);
    }
    if !ctx.parent_vlm_feedback_summary.is_empty() {
        let _ = writeln!(
            parent_feedback,
            "Plot feedback:\n{}",
            ctx.parent_vlm_feedback_summary
        );
    }
    if !ctx.parent_term_out.is_empty() {
        let _ = writeln!(
            parent_feedback,
            "Previous execution output (trimmed):\n{}",
            wrap_code(ctx.parent_term_out, "")
        );
    }
    if !ctx.exec_time_feedback.is_empty() {
        let _ = writeln!(parent_feedback, "Runtime feedback: {}", ctx.exec_time_feedback);
    }
    push_section(&mut out, "Feedback from the previous attempt", &parent_feedback);

    if !ctx.user_feedback_payload.is_empty() {
        push_section(
            &mut out,
            "Operator feedback",
            &format!(
                "The operator interrupted the previous run with this feedback; address it first:\n\n{}",
                ctx.user_feedback_payload
            ),
        );
    }

    if matches!(
        ctx.stage_identifier,
        StageIdentifier::Stage3 | StageIdentifier::Stage4
    ) {
        push_section(
            &mut out,
            "Plotting guidelines",
            "Save every figure as a .png under `./working/` with readable axis labels, titles, \
             and legends. Store raw results in `./working/experiment_data.npy` so metrics can be \
             recomputed.",
        );
    } else {
        push_section(
            &mut out,
            "Result data",
            "Store raw results in `./working/experiment_data.npy` so metrics can be recomputed.",
        );
    }

    if !ctx.seed_agg_block.trim().is_empty() {
        push_section(&mut out, "Seed aggregation", ctx.seed_agg_block);
    }

    push_section(
        &mut out,
        &format!("Result contract (`{}`)", ctx.output_json_name),
        ctx.contract_block,
    );

    out.push('\n');
    out
}

/// Render `codex_metrics_task.md` - the second Codex pass that produces
/// `parse_metrics.py`.
pub fn render_metrics_task_markdown(
    stage_identifier: StageIdentifier,
    evaluation_metric: &EvaluationMetricSpec,
    agent_file_name: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Metrics parsing task ({})\n",
        stage_identifier.prefixed_name()
    );
    let _ = writeln!(
        out,
        "Write a standalone script `parse_metrics.py` in the current directory. It must:\n\
         \n\
         - load `./working/experiment_data.npy` (the data written by `{}`),\n\
         - compute, per dataset, the final and best value of every tracked metric,\n\
         - print one line per metric and dataset in a stable, parseable format\n\
         (e.g. `metric=<name> dataset=<dataset> final=<float> best=<float>`),\n\
         - exit with code 0 on success.\n\
         \n\
         Do not retrain anything; only read the stored results. The run-wide evaluation\n\
         metric specification is:\n\n{}",
        agent_file_name,
        wrap_code(
            &serde_json::to_string_pretty(&evaluation_metric.to_json()).unwrap_or_default(),
            "json"
        )
    );
    out.push('\n');
    out
}

/// Best-effort snapshot of the worker's environment for the task markdown.
/// Failures produce a partial object, never an error.
pub fn build_environment_context(gpu_id: Option<usize>, workspace_dir: &Path) -> Value {
    let mut ctx = serde_json::Map::new();
    ctx.insert(
        "gpu".to_string(),
        match gpu_id {
            Some(id) => serde_json::json!({ "visible": true, "cuda_device": id }),
            None => serde_json::json!({ "visible": false }),
        },
    );
    if let Ok(metadata) = std::fs::metadata(workspace_dir) {
        ctx.insert(
            "workspace".to_string(),
            serde_json::json!({
                "path": workspace_dir.to_string_lossy(),
                "is_dir": metadata.is_dir(),
            }),
        );
    }
    let datasets_dir = workspace_dir.join("datasets");
    if let Ok(entries) = std::fs::read_dir(&datasets_dir) {
        let names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        ctx.insert("datasets".to_string(), serde_json::json!(names));
    }
    Value::Object(ctx)
}

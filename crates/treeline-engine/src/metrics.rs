//! The inline metrics sub-pass.
//!
//! Two steps: Codex generates `parse_metrics.py` (seed-eval runs reuse the
//! parent's script instead), then the harness executes it and has the
//! feedback LLM extract structured metrics from its output.

use crate::error::EngineError;
use crate::prompts::render_metrics_task_markdown;
use crate::types::NodeTask;
use crate::worker::WorkerDeps;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use treeline_codex::CodexRunner;
use treeline_core::{
    MetricValue, Node, RunCompletedPayload, RunStatus, RunType, RunningCodePayload, TimelineEvent,
};
use treeline_llm::{structured_query_as, MetricParseResponse};

const METRICS_SESSION_LOG: &str = "codex_session__metrics.log";
const METRICS_EVENTS_LOG: &str = "codex_events__metrics.jsonl";

/// Compute and assign the node's metric. Every failure mode sets the worst
/// metric and marks the node buggy; nothing here is fatal to the worker.
#[allow(clippy::too_many_arguments)]
pub async fn generate_and_assign_metrics(
    task: &NodeTask,
    deps: &WorkerDeps,
    workspace_dir: &Path,
    working_dir: &Path,
    venv_dir: &Path,
    codex_env: &HashMap<String, String>,
    parent_node: Option<&Node>,
    node: &mut Node,
) {
    if node.is_buggy == Some(true) {
        node.metric = Some(MetricValue::worst());
        return;
    }

    let experiment_data = working_dir.join("experiment_data.npy");
    if !experiment_data.exists() {
        deps.emitter.emit(&TimelineEvent::run_log(
            "No working/experiment_data.npy found; cannot compute metrics.",
            "warn",
        ));
        mark_failed(node);
        return;
    }
    if task.cfg.agent.feedback.model.trim().is_empty() {
        mark_failed(node);
        return;
    }

    let parse_metrics_path = workspace_dir.join("parse_metrics.py");
    if task.seed_eval {
        // Seed evaluation must reuse the parent's script so every seed is
        // measured identically.
        let parent_code = parent_node
            .map(|p| p.parse_metrics_code.clone())
            .unwrap_or_default();
        if parent_code.trim().is_empty() {
            deps.emitter.emit(&TimelineEvent::run_log(
                "Seed evaluation requires reusing the parent's parse_metrics.py, but it was \
                 missing. Cannot compute metrics for seed-eval run.",
                "warn",
            ));
            mark_failed(node);
            return;
        }
        if let Err(e) = std::fs::write(&parse_metrics_path, &parent_code) {
            warn!("failed writing parse_metrics.py: {}", e);
            mark_failed(node);
            return;
        }
    } else if !generate_parse_metrics_script(task, deps, workspace_dir, codex_env).await
        || !parse_metrics_path.exists()
    {
        deps.emitter.emit(&TimelineEvent::run_log(
            "Codex did not produce parse_metrics.py; cannot compute metrics.",
            "warn",
        ));
        mark_failed(node);
        return;
    }

    node.parse_metrics_code = std::fs::read_to_string(&parse_metrics_path).unwrap_or_default();

    let started_at = Utc::now();
    deps.emitter.emit(&TimelineEvent::RunningCode(RunningCodePayload {
        execution_id: task.execution_id.clone(),
        stage: task.stage_name(),
        run_type: RunType::RunfileExecution,
        execution_type: treeline_core::ExecutionType::Metrics,
        code: node.parse_metrics_code.clone(),
        started_at: started_at.to_rfc3339(),
        is_seed_node: task.seed_eval,
        is_seed_agg_node: task.seed_aggregation.is_some(),
        node_index: task.node_index,
    }));
    let run = run_parse_metrics(task, workspace_dir, venv_dir).await;
    let (output, run_ok, exec_time) = match &run {
        Ok((output, exec_time)) => (output.clone(), true, *exec_time),
        Err(e) => {
            warn!("parse_metrics.py execution failed: {}", e);
            (e.to_string(), false, 0.0)
        }
    };
    deps.emitter.emit(&TimelineEvent::RunCompleted(RunCompletedPayload {
        execution_id: task.execution_id.clone(),
        stage: task.stage_name(),
        run_type: RunType::RunfileExecution,
        execution_type: treeline_core::ExecutionType::Metrics,
        status: if run_ok {
            RunStatus::Success
        } else {
            RunStatus::Failed
        },
        exec_time,
        completed_at: Utc::now().to_rfc3339(),
        is_seed_node: task.seed_eval,
        is_seed_agg_node: task.seed_aggregation.is_some(),
        node_index: task.node_index,
    }));

    let _ = std::fs::write(
        workspace_dir.join("metrics_pass__parse_output.log"),
        &output,
    );
    if !run_ok {
        mark_failed(node);
        return;
    }

    let prompt = format!(
        "Extract the evaluation metrics from the output of a metrics-parsing script. The \
         run-wide evaluation metric specification is:\n{}\n\nScript output:\n```\n{}\n```\n\n\
         Report every metric with its per-dataset final and best values. Set \
         valid_metrics_received=false when the output contains no usable metrics.",
        serde_json::to_string_pretty(&task.evaluation_metric.to_json()).unwrap_or_default(),
        output,
    );
    let response: Result<MetricParseResponse, _> = structured_query_as(
        deps.llm.as_ref(),
        prompt,
        None,
        &task.cfg.agent.feedback.model,
        task.cfg.agent.feedback.temperature,
    )
    .await;

    match response {
        Ok(parsed) if parsed.valid_metrics_received && !parsed.metric_names.is_empty() => {
            let mut datasets: Vec<String> = parsed
                .metric_names
                .iter()
                .flat_map(|m| m.data.iter().map(|d| d.dataset_name.trim().to_string()))
                .filter(|d| !d.is_empty())
                .collect();
            datasets.sort();
            datasets.dedup();
            node.datasets_successfully_tested = datasets;
            let value: Value = serde_json::json!({
                "metric_names": serde_json::to_value(&parsed.metric_names).unwrap_or(Value::Null)
            });
            node.metric = Some(MetricValue::new(value));
            debug!(
                "metrics pass assigned {} metric(s) for node {}",
                parsed.metric_names.len(),
                node.id
            );
        }
        Ok(_) => {
            deps.emitter.emit(&TimelineEvent::run_log(
                "Metrics parsing returned no valid metrics.",
                "warn",
            ));
            mark_failed(node);
        }
        Err(e) => {
            warn!("metric extraction LLM call failed: {}", e);
            mark_failed(node);
        }
    }
}

fn mark_failed(node: &mut Node) {
    node.metric = Some(MetricValue::worst());
    node.is_buggy = Some(true);
}

/// Second Codex invocation producing `parse_metrics.py`; uses its own
/// session/events files so the two passes stay distinguishable.
async fn generate_parse_metrics_script(
    task: &NodeTask,
    deps: &WorkerDeps,
    workspace_dir: &Path,
    codex_env: &HashMap<String, String>,
) -> bool {
    let markdown = render_metrics_task_markdown(
        task.stage_identifier,
        &task.evaluation_metric,
        &task.cfg.exec.agent_file_name,
    );
    let task_path = workspace_dir.join("codex_metrics_task.md");
    if let Err(e) = std::fs::write(&task_path, markdown) {
        warn!("failed writing codex_metrics_task.md: {}", e);
        return false;
    }

    let runner = CodexRunner::new(
        workspace_dir,
        Duration::from_secs(task.cfg.exec.timeout_secs),
        crate::worker::codex_argv(&task.cfg),
        codex_env.clone(),
    )
    .with_log_names(METRICS_SESSION_LOG, METRICS_EVENTS_LOG);

    let registry = deps.registry.clone();
    let execution_id = task.execution_id.clone();
    let pid_callback: treeline_codex::PidCallback = Arc::new(move |pid| {
        registry.update_pid(&execution_id, pid);
    });
    let registry = deps.registry.clone();
    let execution_id = task.execution_id.clone();
    let termination_checker: treeline_codex::TerminationChecker =
        Arc::new(move || registry.is_terminated(&execution_id));

    let outcome = runner
        .run(&task_path, Some(pid_callback), Some(termination_checker), None)
        .await;
    outcome.succeeded()
}

/// Run the generated script in the worker's venv as a plain subprocess with
/// the configured execution timeout.
async fn run_parse_metrics(
    task: &NodeTask,
    workspace_dir: &Path,
    venv_dir: &Path,
) -> Result<(String, f64), EngineError> {
    let venv_python = venv_dir.join("bin").join("python");
    let python = if venv_python.exists() {
        venv_python
    } else {
        std::path::PathBuf::from("python3")
    };
    let started = std::time::Instant::now();
    let mut child = tokio::process::Command::new(python)
        .arg("parse_metrics.py")
        .current_dir(workspace_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let timeout = Duration::from_secs(task.cfg.exec.timeout_secs);
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                text.push_str("\n--- stderr ---\n");
                text.push_str(stderr.trim());
            }
            if output.status.success() {
                Ok((text, started.elapsed().as_secs_f64()))
            } else {
                Err(EngineError::internal(format!(
                    "parse_metrics.py exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    text
                )))
            }
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EngineError::internal(format!(
            "parse_metrics.py timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

//! One dispatched node attempt: workspace prep, Codex invocation, contract
//! validation, metrics sub-pass, VLM feedback, artifact collection.
//!
//! The worker never panics the run: every failure mode degrades to a buggy
//! node snapshot, except intentional termination which surfaces as
//! `EngineError::ExecutionTerminated`.

use crate::contract::{
    contract_lines_for_stage, count_working_pngs, seed_aggregation_contract_lines,
    seed_aggregation_instruction_lines, validate_node_result, ContractContext,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics::generate_and_assign_metrics;
use crate::prompts::{build_environment_context, render_codex_task_markdown, CodexTaskContext};
use crate::registry::ExecutionRegistry;
use crate::types::NodeTask;
use crate::vlm::generate_vlm_feedback;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use treeline_codex::{CodexRunOutcome, CodexRunner, DEFAULT_CODEX_ARGV};
use treeline_core::{
    MetricValue, Node, RunCompletedPayload, RunStatus, RunType, RunningCodePayload, StageIdentifier,
    TimelineEvent,
};
use treeline_llm::{structured_query_as, LlmClient, TrainingReview};
use treeline_telemetry::EventEmitter;

const DEFAULT_EXAMPLE_CODE: &str = r#"import numpy as np

# Minimal shape of an experiment: produce results, store them for the
# metrics pass, and keep the run reproducible.
rng = np.random.default_rng(0)
xs = rng.normal(size=(256, 8))
ys = xs @ rng.normal(size=8) + 0.1 * rng.normal(size=256)
weights, *_ = np.linalg.lstsq(xs, ys, rcond=None)
mse = float(np.mean((xs @ weights - ys) ** 2))
print(f"metric=mse dataset=synthetic final={mse:.6f} best={mse:.6f}")
np.save("working/experiment_data.npy", {"synthetic": {"mse": mse}}, allow_pickle=True)
"#;

pub struct WorkerDeps {
    pub registry: Arc<ExecutionRegistry>,
    pub emitter: EventEmitter,
    pub llm: Arc<dyn LlmClient>,
}

/// Run one node attempt end-to-end and return the serialized node snapshot.
pub async fn process_node(task: NodeTask, deps: &WorkerDeps) -> EngineResult<Value> {
    let stage_name = task.stage_name();
    let (workspace_dir, working_dir) = prepare_workspace(&task)?;
    let venv_dir = ensure_venv(&task.cfg.workspace_dir).await;
    let codex_env = build_codex_env(&venv_dir, task.gpu_id);

    let parent_node = match &task.parent_snapshot {
        Some(snapshot) => Some(Node::from_value(snapshot.clone())?),
        None => None,
    };
    debug!(
        "worker begin execution_id={} stage={} seed_eval={} parent={:?} workspace={}",
        task.execution_id,
        stage_name,
        task.seed_eval,
        parent_node.as_ref().map(|n| n.id.clone()),
        workspace_dir.display()
    );

    abort_if_skip_requested(&task.execution_id, deps, 0.0)?;

    let output_json_file = workspace_dir.join("node_result.json");
    let task_file = write_codex_task_file(
        &task,
        &workspace_dir,
        &venv_dir,
        parent_node.as_ref(),
        &output_json_file,
    )?;

    let started_at = Utc::now();
    deps.emitter
        .emit(&TimelineEvent::run_log("Executing via Codex CLI...", "info"));
    deps.emitter.emit(&TimelineEvent::RunningCode(RunningCodePayload {
        execution_id: task.execution_id.clone(),
        stage: stage_name.clone(),
        run_type: RunType::CodexExecution,
        execution_type: task.execution_type(),
        code: "(Codex-managed)".to_string(),
        started_at: started_at.to_rfc3339(),
        is_seed_node: task.seed_eval,
        is_seed_agg_node: task.seed_aggregation.is_some(),
        node_index: task.node_index,
    }));

    let outcome = run_codex(&task, deps, &workspace_dir, &codex_env, &task_file).await;

    let status = if outcome.succeeded() {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };
    deps.emitter.emit(&TimelineEvent::RunCompleted(RunCompletedPayload {
        execution_id: task.execution_id.clone(),
        stage: stage_name.clone(),
        run_type: RunType::CodexExecution,
        execution_type: task.execution_type(),
        status,
        exec_time: outcome.exec_time,
        completed_at: Utc::now().to_rfc3339(),
        is_seed_node: task.seed_eval,
        is_seed_agg_node: task.seed_aggregation.is_some(),
        node_index: task.node_index,
    }));
    if outcome.succeeded() {
        deps.registry.mark_completed(&task.execution_id);
    } else {
        deps.registry.clear_pid(&task.execution_id);
    }
    if outcome.exc_type.as_deref() == Some("Terminated") {
        return Err(EngineError::ExecutionTerminated {
            execution_id: task.execution_id.clone(),
            exec_time: outcome.exec_time,
        });
    }

    let node_result = load_node_result(&output_json_file);
    let Some(mut node_result) = node_result else {
        debug!(
            "missing/invalid node_result.json for execution_id={}",
            task.execution_id
        );
        let mut child = buggy_node(
            &task,
            parent_node.as_ref(),
            "Codex did not produce a valid node_result.json.",
            outcome
                .exc_type
                .clone()
                .unwrap_or_else(|| "CodexError".to_string()),
            &outcome,
        );
        move_experiment_artifacts(&task, &mut child, &working_dir, &deps.emitter);
        return Ok(child.to_value());
    };

    if let Some(obj) = node_result.as_object_mut() {
        obj.insert("id".to_string(), Value::String(task.execution_id.clone()));
        obj.insert(
            "parent_id".to_string(),
            parent_node
                .as_ref()
                .map(|p| Value::String(p.id.clone()))
                .unwrap_or(Value::Null),
        );
    }

    let contract_ctx = ContractContext {
        stage_identifier: task.stage_identifier,
        is_seed_aggregation: task.seed_aggregation.is_some(),
        seed_eval: task.seed_eval,
        seed_value: task.seed_value,
        working_png_count: count_working_pngs(&working_dir),
        expected_hyperparam_name: task.hyperparam_idea.as_ref().map(|i| i.name.clone()),
        expected_ablation_name: task.ablation_idea.as_ref().map(|i| i.name.clone()),
    };
    let contract_errors = validate_node_result(&node_result, &contract_ctx);
    if !contract_errors.is_empty() {
        debug!(
            "node_result contract failed for execution_id={}: {:?}",
            task.execution_id, contract_errors
        );
        let analysis = format!(
            "Codex node_result contract violation(s):\n- {}",
            contract_errors.join("\n- ")
        );
        let mut child = buggy_node(
            &task,
            parent_node.as_ref(),
            &analysis,
            outcome
                .exc_type
                .clone()
                .unwrap_or_else(|| "CodexContractError".to_string()),
            &outcome,
        );
        // Preserve what Codex claimed it did for diagnostics.
        child.plan = string_field(&node_result, "plan");
        child.code = string_field(&node_result, "code");
        child.is_buggy_plots = Some(true);
        move_experiment_artifacts(&task, &mut child, &working_dir, &deps.emitter);
        return Ok(child.to_value());
    }

    let mut child = match Node::from_value(node_result.clone()) {
        Ok(node) => node,
        Err(e) => {
            let analysis = format!("Failed to parse node_result.json into a node: {}", e);
            let mut child = buggy_node(
                &task,
                parent_node.as_ref(),
                &analysis,
                outcome
                    .exc_type
                    .clone()
                    .unwrap_or_else(|| "NodeParseError".to_string()),
                &outcome,
            );
            child.plan = string_field(&node_result, "plan");
            child.code = string_field(&node_result, "code");
            child.is_buggy_plots = Some(true);
            move_experiment_artifacts(&task, &mut child, &working_dir, &deps.emitter);
            return Ok(child.to_value());
        }
    };

    child.absorb_exec_result(
        outcome.term_out.clone(),
        outcome.exec_time,
        outcome.exc_type.clone(),
        outcome.exc_info.clone(),
    );
    if parent_node.is_some() && child.parent.is_none() {
        child.parent = parent_node.as_ref().map(|p| p.id.clone());
    }
    if child.metric.is_none() {
        child.metric = Some(MetricValue::worst());
        if child.is_buggy.is_none() {
            child.is_buggy = Some(true);
        }
    }

    if child
        .analysis
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        apply_llm_review(&task, deps, &mut child, &outcome).await;
    }

    abort_if_skip_requested(&task.execution_id, deps, outcome.exec_time)?;

    if child.is_buggy == Some(false) {
        generate_and_assign_metrics(
            &task,
            deps,
            &workspace_dir,
            &working_dir,
            &venv_dir,
            &codex_env,
            parent_node.as_ref(),
            &mut child,
        )
        .await;
    } else {
        child.metric = Some(MetricValue::worst());
    }

    move_experiment_artifacts(&task, &mut child, &working_dir, &deps.emitter);

    if child.is_buggy == Some(false)
        && matches!(
            task.stage_identifier,
            StageIdentifier::Stage3 | StageIdentifier::Stage4
        )
    {
        generate_vlm_feedback(&task, deps, &mut child).await;
    }

    Ok(child.to_value())
}

fn abort_if_skip_requested(
    execution_id: &str,
    deps: &WorkerDeps,
    exec_time: f64,
) -> EngineResult<()> {
    if let Some(reason) = deps.registry.is_skip_pending(execution_id) {
        info!(
            "skip pending for execution_id={} (reason={}); aborting",
            execution_id, reason
        );
        return Err(EngineError::ExecutionTerminated {
            execution_id: execution_id.to_string(),
            exec_time,
        });
    }
    Ok(())
}

/// `<workspace>/executions/<stage>_<utc>_<pid>[ _<suffix>]` plus `working/`.
fn prepare_workspace(task: &NodeTask) -> EngineResult<(PathBuf, PathBuf)> {
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let exec_root = task.cfg.workspace_dir.join("executions");
    std::fs::create_dir_all(&exec_root)?;

    let base_name = format!("{}_{}_{}", task.stage_name(), ts, std::process::id());
    let mut workspace = exec_root.join(&base_name);
    let mut created = false;
    for suffix in 0..1000u32 {
        let candidate = if suffix == 0 {
            exec_root.join(&base_name)
        } else {
            exec_root.join(format!("{}_{}", base_name, suffix))
        };
        match std::fs::create_dir(&candidate) {
            Ok(()) => {
                workspace = candidate;
                created = true;
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if !created {
        return Err(EngineError::internal(format!(
            "failed to create unique execution workspace under {}",
            exec_root.display()
        )));
    }

    let working = workspace.join("working");
    std::fs::create_dir_all(&working)?;

    let example_code = task
        .task_desc
        .code
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_EXAMPLE_CODE.to_string());
    if let Err(e) = std::fs::write(workspace.join("example_code.py"), example_code) {
        debug!("failed writing example_code.py: {}", e);
    }

    Ok((workspace, working))
}

/// A shared venv per run; repeated per-workspace installs are avoided by
/// pointing Codex at it through env vars.
async fn ensure_venv(run_workspace: &Path) -> PathBuf {
    let venv_dir = run_workspace.join(".venv");
    if venv_dir.join("bin").join("python").exists() {
        return venv_dir;
    }
    let result = tokio::process::Command::new("python3")
        .args(["-m", "venv"])
        .arg(&venv_dir)
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            "venv creation failed ({}); continuing with system python",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("venv creation failed: {}; continuing with system python", e),
    }
    venv_dir
}

fn build_codex_env(venv_dir: &Path, gpu_id: Option<usize>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    let bin_dir = venv_dir.join("bin");
    env.insert("VIRTUAL_ENV".into(), venv_dir.to_string_lossy().into_owned());
    let path = env.get("PATH").cloned().unwrap_or_default();
    env.insert(
        "PATH".into(),
        format!("{}:{}", bin_dir.to_string_lossy(), path),
    );
    env.insert("PIP_REQUIRE_VIRTUALENV".into(), "1".into());
    env.insert("PYTHONNOUSERSITE".into(), "1".into());
    if let Some(key) = env.get("OPENAI_API_KEY").cloned() {
        env.insert("CODEX_API_KEY".into(), key);
    }
    env.insert("CI".into(), "1".into());
    env.insert("NO_UPDATE_NOTIFIER".into(), "1".into());
    env.insert("DISABLE_UPDATE_NOTIFIER".into(), "1".into());
    env.insert("npm_config_update_notifier".into(), "false".into());
    env.insert(
        "CUDA_VISIBLE_DEVICES".into(),
        gpu_id.map(|id| id.to_string()).unwrap_or_default(),
    );
    env
}

fn write_codex_task_file(
    task: &NodeTask,
    workspace_dir: &Path,
    venv_dir: &Path,
    parent_node: Option<&Node>,
    output_json_file: &Path,
) -> EngineResult<PathBuf> {
    let env_ctx = build_environment_context(task.gpu_id, workspace_dir);

    let (contract_block, seed_agg_block) = if let Some(aggregation) = &task.seed_aggregation {
        let mut lines = crate::contract::common_contract_lines();
        lines.extend(seed_aggregation_contract_lines());
        let mut block = seed_aggregation_instruction_lines().join("\n");
        block.push_str("\n\nPer-seed results to aggregate:\n");
        for value in &aggregation.seed_nodes {
            let node = Node::from_value(value.clone()).unwrap_or_default();
            block.push_str(&format!(
                "- node {}: results_dir={} metric={}\n",
                node.id,
                node.exp_results_dir.as_deref().unwrap_or("(missing)"),
                node.metric
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
            ));
        }
        (lines.join("\n"), block)
    } else {
        (
            contract_lines_for_stage(task.stage_identifier).join("\n"),
            String::new(),
        )
    };

    let base_code = parent_node.map(|p| p.code.clone()).unwrap_or_default();
    let parent_term_out = parent_node
        .map(|p| p.term_out_text(6000))
        .unwrap_or_default();
    let parent_exc_type = parent_node
        .and_then(|p| p.exc_type.clone())
        .unwrap_or_default();
    let parent_analysis = parent_node
        .and_then(|p| p.analysis.clone())
        .unwrap_or_default();
    let parent_vlm = parent_node
        .map(|p| p.vlm_feedback_summary.join("\n"))
        .unwrap_or_default();
    let exec_time_feedback = parent_node
        .map(|p| p.exec_time_feedback.clone())
        .unwrap_or_default();

    let ctx = CodexTaskContext {
        execution_id: &task.execution_id,
        stage_identifier: task.stage_identifier,
        timeout_seconds: task.cfg.exec.timeout_secs,
        curated_task_desc: &task.curated_task_desc,
        stage_goals: &task.stage_goals,
        memory_summary: &task.memory_summary,
        venv_dir: &venv_dir.to_string_lossy(),
        environment_context: &env_ctx,
        num_syn_datasets: task.cfg.experiment.num_syn_datasets,
        k_fold_validation: task.cfg.agent.k_fold_validation,
        evaluation_metric: &task.evaluation_metric,
        hyperparam_idea: task.hyperparam_idea.as_ref(),
        ablation_idea: task.ablation_idea.as_ref(),
        base_code: &base_code,
        parent_term_out: &parent_term_out,
        parent_exc_type: &parent_exc_type,
        parent_analysis: &parent_analysis,
        parent_vlm_feedback_summary: &parent_vlm,
        exec_time_feedback: &exec_time_feedback,
        user_feedback_payload: &task.user_feedback_payload,
        seed_agg_block: &seed_agg_block,
        contract_block: &contract_block,
        output_json_name: &output_json_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "node_result.json".to_string()),
        agent_file_name: &task.cfg.exec.agent_file_name,
    };
    let markdown = render_codex_task_markdown(&ctx);
    let task_path = workspace_dir.join("codex_task.md");
    std::fs::write(&task_path, markdown)?;
    Ok(task_path)
}

async fn run_codex(
    task: &NodeTask,
    deps: &WorkerDeps,
    workspace_dir: &Path,
    codex_env: &HashMap<String, String>,
    task_file: &Path,
) -> CodexRunOutcome {
    let runner = CodexRunner::new(
        workspace_dir,
        Duration::from_secs(task.cfg.exec.timeout_secs),
        codex_argv(&task.cfg),
        codex_env.clone(),
    );

    let registry = deps.registry.clone();
    let execution_id = task.execution_id.clone();
    let pid_callback: treeline_codex::PidCallback = Arc::new(move |pid| {
        registry.update_pid(&execution_id, pid);
    });

    let registry = deps.registry.clone();
    let execution_id = task.execution_id.clone();
    let termination_checker: treeline_codex::TerminationChecker =
        Arc::new(move || registry.is_terminated(&execution_id));

    let emitter = deps.emitter.clone();
    let stream_callback: treeline_codex::StreamCallback = Arc::new(move |msg| {
        emitter.emit(&TimelineEvent::run_log(msg, "info"));
    });

    runner
        .run(
            task_file,
            Some(pid_callback),
            Some(termination_checker),
            Some(stream_callback),
        )
        .await
}

/// The configured Codex argv, falling back to the stock invocation.
pub(crate) fn codex_argv(cfg: &treeline_core::Config) -> Vec<String> {
    if cfg.exec.codex_argv.is_empty() {
        DEFAULT_CODEX_ARGV.iter().map(|s| s.to_string()).collect()
    } else {
        cfg.exec.codex_argv.clone()
    }
}

fn load_node_result(output_json_file: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(output_json_file).ok()?;
    let parsed: Value = serde_json::from_str(&text).ok()?;
    parsed.is_object().then_some(parsed)
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn buggy_node(
    task: &NodeTask,
    parent_node: Option<&Node>,
    analysis: &str,
    exc_type: String,
    outcome: &CodexRunOutcome,
) -> Node {
    let mut node = Node::with_id(task.execution_id.clone());
    node.is_buggy = Some(true);
    node.analysis = Some(analysis.to_string());
    node.exc_type = Some(exc_type);
    node.metric = Some(MetricValue::worst());
    node.parent = parent_node.map(|p| p.id.clone());
    node.is_seed_node = task.seed_eval;
    node.is_seed_agg_node = task.seed_aggregation.is_some();
    node.term_out = outcome.term_out.clone();
    node.exec_time = Some(outcome.exec_time);
    node.exc_info = outcome.exc_info.clone();
    node
}

async fn apply_llm_review(
    task: &NodeTask,
    deps: &WorkerDeps,
    child: &mut Node,
    outcome: &CodexRunOutcome,
) {
    let prompt = format!(
        "Analyze the execution output, determine if there were any bugs, and provide a summary \
         of the findings. If there is a bug, summarize the failure and propose a concrete fix \
         direction.\n\nResearch idea:\n{}\n\nStage: {}\nStage goals:\n{}\n\n\
         Execution output:\n```\n{}\n```\n\nException type: {}\nExecution time (seconds): {}",
        task.curated_task_desc,
        task.stage_identifier.prefixed_name(),
        task.stage_goals,
        child.term_out_text(6000),
        outcome.exc_type.as_deref().unwrap_or(""),
        outcome.exec_time,
    );
    let review: Result<TrainingReview, _> = structured_query_as(
        deps.llm.as_ref(),
        prompt,
        None,
        &task.cfg.agent.feedback.model,
        task.cfg.agent.feedback.temperature,
    )
    .await;
    match review {
        Ok(review) => {
            if !review.summary.trim().is_empty() {
                child.analysis = Some(review.summary.trim().to_string());
            }
            if review.is_bug {
                child.is_buggy = Some(true);
            }
        }
        Err(e) => warn!("failed to summarize execution output via LLM: {}", e),
    }
}

/// Copy the Codex artifacts and move experiment outputs into the run's logs
/// directory, recording plot bookkeeping on the node.
fn move_experiment_artifacts(
    task: &NodeTask,
    child: &mut Node,
    working_dir: &Path,
    emitter: &EventEmitter,
) {
    if !working_dir.exists() {
        return;
    }
    let exp_results_dir = task.cfg.run_logs_dir().join("experiment_results").join(format!(
        "experiment_{}_proc_{}",
        child.id,
        std::process::id()
    ));
    child.exp_results_dir = Some(exp_results_dir.to_string_lossy().into_owned());
    if let Err(e) = std::fs::create_dir_all(&exp_results_dir) {
        warn!("failed to create {}: {}", exp_results_dir.display(), e);
        return;
    }

    let workspace_dir = working_dir.parent().unwrap_or(working_dir);
    for fname in [
        "codex_task.md",
        "codex_session.log",
        "codex_events.jsonl",
        "node_result.json",
    ] {
        let src = workspace_dir.join(fname);
        if !src.exists() {
            continue;
        }
        if let Err(e) = std::fs::copy(&src, exp_results_dir.join(fname)) {
            debug!("artifact copy failed {}: {}", src.display(), e);
        }
    }

    for fname in [
        "codex_metrics_task.md",
        "codex_session__metrics.log",
        "codex_events__metrics.jsonl",
        "parse_metrics.py",
    ] {
        let src = workspace_dir.join(fname);
        if !src.exists() {
            continue;
        }
        let dst = exp_results_dir.join(format!("metrics_pass__{}", fname));
        if let Err(e) = std::fs::copy(&src, dst) {
            debug!("metrics artifact copy failed {}: {}", src.display(), e);
        }
    }
    if let Ok(entries) = std::fs::read_dir(workspace_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("metrics_pass__") {
                if let Err(e) = std::fs::copy(entry.path(), exp_results_dir.join(&name)) {
                    debug!("metrics artifact copy failed {}: {}", name, e);
                }
            }
        }
    }

    let agent_file = workspace_dir.join(&task.cfg.exec.agent_file_name);
    if agent_file.exists() {
        if let Err(e) = std::fs::copy(&agent_file, exp_results_dir.join("experiment_code.py")) {
            debug!("experiment code copy failed: {}", e);
        }
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(working_dir)
        .map(|rd| rd.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    let mut png_count = 0usize;
    for path in entries {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("npy") => {
                let Some(name) = path.file_name() else { continue };
                if let Err(e) = std::fs::rename(&path, exp_results_dir.join(name)) {
                    debug!("npy move failed {}: {}", path.display(), e);
                }
            }
            Some("png") => {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };
                let final_path = exp_results_dir.join(&name);
                if let Err(e) = std::fs::rename(&path, &final_path) {
                    debug!("png move failed {}: {}", path.display(), e);
                    continue;
                }
                png_count += 1;
                let run_name = task
                    .cfg
                    .workspace_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "run".to_string());
                child.plots.push(format!(
                    "../../logs/{}/experiment_results/experiment_{}_proc_{}/{}",
                    run_name,
                    child.id,
                    std::process::id(),
                    name
                ));
                child
                    .plot_paths
                    .push(final_path.to_string_lossy().into_owned());
            }
            _ => {}
        }
    }
    if png_count > 0 {
        emitter.emit(&TimelineEvent::run_log(
            format!("Generated {} plot file(s)", png_count),
            "info",
        ));
    }
}

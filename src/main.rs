//! treeline - autonomous research-experiment orchestrator.
//!
//! Loads the run configuration and research idea, wires the telemetry stack
//! (event queue, webhook drain, heartbeat, hardware stats), and drives the
//! staged tree-search experiment loop.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use treeline_core::{Config, StageProgressPayload, TaskDescription, TimelineEvent};
use treeline_engine::{ExecutionRegistry, StageControl, StageManager};
use treeline_llm::AnthropicClient;
use treeline_telemetry::hw::{spawn_heartbeat, spawn_hw_stats};
use treeline_telemetry::queue::DEFAULT_QUEUE_CAPACITY;
use treeline_telemetry::{EventPersistenceWorker, EventQueue, WebhookClient};

#[derive(Parser)]
#[command(name = "treeline", about = "Staged tree-search experiment orchestrator")]
struct Cli {
    /// Path to the run configuration (JSON)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Path to the research idea (JSON)
    #[arg(short, long, default_value = "idea.json")]
    idea: PathBuf,

    /// Override the workspace directory from the config
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Directory for the rotating log file
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(workspace) = cli.workspace {
        cfg.workspace_dir = workspace;
    }

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "treeline.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file_writer)
        .with_ansi(false)
        .init();

    let idea_text = std::fs::read_to_string(&cli.idea)
        .with_context(|| format!("loading idea from {}", cli.idea.display()))?;
    let task_desc: TaskDescription = serde_json::from_str(&idea_text)?;
    info!("loaded research idea: {}", task_desc.title);

    std::fs::create_dir_all(&cfg.workspace_dir)?;

    // Telemetry stack: webhook client, bounded event queue, single drain task.
    let webhook = WebhookClient::new(
        cfg.telemetry.base_url.clone(),
        cfg.telemetry.token.clone(),
        cfg.telemetry.run_id.clone(),
    );
    let (emitter, queue_rx) = EventQueue::bounded(DEFAULT_QUEUE_CAPACITY);
    let drain = tokio::spawn(EventPersistenceWorker::new(webhook.clone()).run(queue_rx));

    let cancel = tokio_util::sync::CancellationToken::new();
    let heartbeat = spawn_heartbeat(webhook.clone(), cancel.clone());
    let hw_stats = spawn_hw_stats(
        webhook.clone(),
        vec![PathBuf::from("/"), cfg.workspace_dir.clone()],
        cancel.clone(),
    );

    let _ = webhook.publish_run_started();
    let _ = webhook.publish_initialization_progress("Preparing experiment workspace");

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    let llm = Arc::new(AnthropicClient::new(api_key));
    let registry = Arc::new(ExecutionRegistry::new());
    let control = Arc::new(StageControl::new());

    let mut manager = StageManager::new(
        cfg.clone(),
        task_desc,
        emitter.clone(),
        registry,
        control,
        llm,
    );

    let _ = webhook.publish_initialization_progress("Starting staged experiment loop");

    // Progress snapshots, deduplicated per stage across both callbacks.
    let last_progress = Arc::new(std::sync::Mutex::new(HashMap::<String, f64>::new()));
    let progress_emitter = emitter.clone();
    let iteration_last = last_progress.clone();
    let mut iteration_started = move |meta: &treeline_core::StageMeta,
                                      search: &treeline_engine::JournalSearch| {
        let iteration = search.journal.len() + 1;
        emit_progress(&progress_emitter, &iteration_last, meta, search, iteration);
    };
    let step_emitter = emitter.clone();
    let step_last = last_progress.clone();
    let mut step_done = move |meta: &treeline_core::StageMeta,
                              search: &treeline_engine::JournalSearch| {
        emit_progress(&step_emitter, &step_last, meta, search, search.journal.len());
    };

    let outcome = manager.run(&mut step_done, &mut iteration_started).await;

    let (success, message) = match (&outcome, manager.failure_reason()) {
        (Err(e), _) => {
            error!("experiment run aborted: {}", e);
            (false, Some(e.to_string()))
        }
        (Ok(()), Some(reason)) => (false, Some(reason.to_string())),
        (Ok(()), None) => (true, None),
    };
    info!("experiment run finished (success={})", success);
    let finished = webhook.publish_run_finished(success, message.as_deref());

    // Flush the queue, then stop the periodic publishers.
    emitter.shutdown().await;
    let _ = drain.await;
    cancel.cancel();
    let _ = heartbeat.await;
    let _ = hw_stats.await;
    let _ = finished.await;

    outcome.map_err(Into::into)
}

fn emit_progress(
    emitter: &treeline_telemetry::EventEmitter,
    last: &Arc<std::sync::Mutex<HashMap<String, f64>>>,
    meta: &treeline_core::StageMeta,
    search: &treeline_engine::JournalSearch,
    iteration: usize,
) {
    let max = meta.max_iterations.max(1);
    let progress = (iteration as f64 / max as f64).min(1.0);
    let stage_name = meta.name();
    {
        let mut last = match last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.get(&stage_name).copied() == Some(progress) {
            return;
        }
        last.insert(stage_name.clone(), progress);
    }
    let best_metric = search
        .best_good_node_by_metric()
        .and_then(|n| n.metric.as_ref())
        .map(|m| m.to_string());
    emitter.emit(&TimelineEvent::RunStageProgress(StageProgressPayload {
        stage: stage_name,
        iteration,
        max_iterations: meta.max_iterations,
        progress,
        total_nodes: search.journal.len(),
        buggy_nodes: search.journal.buggy_nodes().len(),
        good_nodes: search.journal.good_nodes().len(),
        best_metric,
        is_seed_node: false,
        is_seed_agg_node: false,
    }));
}

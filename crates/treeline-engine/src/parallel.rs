//! The parallel agent: breadth-first experiment iterations over a bounded
//! set of concurrent node attempts.
//!
//! Responsibilities: node selection (draft/debug/improve with exploration vs
//! exploitation), submission to workers, result collection with per-node
//! timeouts, Stage 2/4 idea proposal, and multi-seed evaluation.

use crate::error::{EngineError, EngineResult};
use crate::gpu::{gpu_count, GpuManager};
use crate::journal_search::JournalSearch;
use crate::registry::{ExecutionRegistry, RegistryStatus};
use crate::types::{EvaluationMetricSpec, NodeTask, SeedAggregationPayload, StageIdea};
use crate::worker::{process_node, WorkerDeps};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treeline_core::{
    Config, GpuShortagePayload, Node, StageIdentifier, TaskDescription, TimelineEvent,
};
use treeline_llm::{
    structured_query_as, AblationIdea, EvaluationMetricSpecResponse, HyperparamTuningIdea,
    LlmClient,
};
use treeline_telemetry::EventEmitter;

/// Python prologue prepended to seed-evaluation runs.
fn seed_prologue(seed: u32) -> String {
    format!(
        "# Set random seed\nimport random\nimport numpy as np\nimport torch\n\nseed = {seed}\n\
         random.seed(seed)\nnp.random.seed(seed)\ntorch.manual_seed(seed)\n\
         if torch.cuda.is_available():\n    torch.cuda.manual_seed(seed)\n\n"
    )
}

pub struct ParallelAgent {
    curated_task_desc: String,
    stage_goals: String,
    task_desc: TaskDescription,
    cfg: Config,
    stage_identifier: StageIdentifier,
    best_stage1_node: Option<Node>,
    best_stage3_node: Option<Node>,
    emitter: EventEmitter,
    registry: Arc<ExecutionRegistry>,
    llm: Arc<dyn LlmClient>,
    num_workers: usize,
    gpu_manager: Option<GpuManager>,
    evaluation_metric: EvaluationMetricSpec,
    tried_hyperparams: HashSet<String>,
    completed_ablations: HashSet<String>,
    active_execution_ids: Mutex<HashSet<String>>,
}

impl ParallelAgent {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        curated_task_desc: String,
        stage_goals: String,
        task_desc: TaskDescription,
        cfg: Config,
        stage_identifier: StageIdentifier,
        best_stage1_node: Option<Node>,
        best_stage3_node: Option<Node>,
        emitter: EventEmitter,
        registry: Arc<ExecutionRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> EngineResult<Self> {
        let num_gpus = gpu_count();
        info!("visible GPUs: {}", num_gpus);
        if num_gpus < cfg.min_num_gpus {
            let message = format!(
                "Detected {} GPU(s) but configuration requires at least {}. Aborting experiment run.",
                num_gpus, cfg.min_num_gpus
            );
            emitter.emit(&TimelineEvent::run_log(message.clone(), "error"));
            emitter.emit(&TimelineEvent::GpuShortage(GpuShortagePayload {
                required_gpus: cfg.min_num_gpus,
                available_gpus: num_gpus,
                message,
            }));
            return Err(EngineError::GpuShortage {
                required: cfg.min_num_gpus,
                available: num_gpus,
            });
        }

        let mut num_workers = cfg.agent.num_workers;
        if num_gpus > 0 {
            num_workers = num_workers.min(num_gpus);
            info!("limiting workers to {} to match GPU count", num_workers);
        }
        let gpu_manager = (num_gpus > 0).then(|| GpuManager::new(num_gpus));

        let evaluation_metric =
            define_global_metric(llm.as_ref(), &cfg, &curated_task_desc).await;

        Ok(Self {
            curated_task_desc,
            stage_goals,
            task_desc,
            cfg,
            stage_identifier,
            best_stage1_node,
            best_stage3_node,
            emitter,
            registry,
            llm,
            num_workers,
            gpu_manager,
            evaluation_metric,
            tried_hyperparams: HashSet::new(),
            completed_ablations: HashSet::new(),
            active_execution_ids: Mutex::new(HashSet::new()),
        })
    }

    pub fn evaluation_metric(&self) -> &EvaluationMetricSpec {
        &self.evaluation_metric
    }

    /// Flag every in-flight execution for skip; workers observe the flag at
    /// their next checkpoint. Does not cancel the tasks.
    pub fn abort_active_executions(&self, reason: &str) {
        let ids: Vec<String> = self
            .lock_active()
            .iter()
            .cloned()
            .collect();
        for execution_id in ids {
            self.registry.flag_skip_pending(&execution_id, reason);
        }
    }

    /// Select up to `num_workers` nodes to process; `None` denotes drafting
    /// a new root.
    fn select_parallel_nodes(&mut self, search: &mut JournalSearch, best_good: Option<Node>) -> Vec<Option<Node>> {
        self.emitter.emit(&TimelineEvent::run_log(
            format!(
                "Selecting nodes to process for iteration {}...",
                search.journal.len()
            ),
            "info",
        ));

        let mut nodes: Vec<Option<Node>> = Vec::new();
        let mut processed_trees: HashSet<String> = HashSet::new();
        let search_cfg = self.cfg.agent.search.clone();

        // Feedback re-runs always go first. A root that already has children
        // hands its payload to the newest child.
        let feedback_ids: Vec<String> = search
            .journal
            .nodes
            .iter()
            .filter(|n| n.user_feedback_pending)
            .map(|n| n.id.clone())
            .collect();
        for id in feedback_ids {
            if nodes.len() >= self.num_workers {
                break;
            }
            let children = search.journal.children_of(&id);
            let is_root = search
                .journal
                .node_by_id(&id)
                .map(|n| n.parent.is_none())
                .unwrap_or(false);
            if is_root && !children.is_empty() {
                let newest_child_id = children
                    .iter()
                    .max_by(|a, b| {
                        a.ctime
                            .partial_cmp(&b.ctime)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|c| c.id.clone());
                let (feedback, payload) = search
                    .journal
                    .node_by_id(&id)
                    .map(|n| (n.is_user_feedback, n.user_feedback_payload.clone()))
                    .unwrap_or((false, None));
                if let Some(node) = search.journal.node_by_id_mut(&id) {
                    node.user_feedback_pending = false;
                }
                if let Some(child_id) = newest_child_id {
                    info!(
                        "re-routing feedback from root {} to its newest child {}",
                        id, child_id
                    );
                    if let Some(child) = search.journal.node_by_id_mut(&child_id) {
                        child.is_user_feedback = feedback;
                        child.user_feedback_payload = payload;
                        child.user_feedback_pending = false;
                        nodes.push(Some(child.clone()));
                    }
                }
                continue;
            }
            if let Some(node) = search.journal.node_by_id_mut(&id) {
                info!(
                    "scheduling node {} to re-run with user feedback",
                    &node.id.chars().take(8).collect::<String>()
                );
                node.user_feedback_pending = false;
                nodes.push(Some(node.clone()));
            }
        }

        while nodes.len() < self.num_workers {
            // Drafting: create root nodes up to the target draft count.
            if search.journal.draft_nodes().len() < search_cfg.num_drafts {
                nodes.push(None);
                continue;
            }

            let viable_trees: Vec<String> = search
                .journal
                .draft_nodes()
                .iter()
                .filter(|root| {
                    !search
                        .journal
                        .leaves_of(&root.id)
                        .iter()
                        .all(|leaf| leaf.is_buggy == Some(true))
                })
                .map(|root| root.id.clone())
                .collect();

            // Debugging phase (probabilistic).
            if rand::thread_rng().gen::<f64>() < search_cfg.debug_prob {
                let debuggable: Vec<Node> = search
                    .journal
                    .buggy_nodes()
                    .iter()
                    .filter(|n| {
                        search.journal.is_leaf(&n.id)
                            && search.journal.debug_depth(&n.id) <= search_cfg.max_debug_depth
                    })
                    .map(|n| (*n).clone())
                    .collect();
                if !debuggable.is_empty() {
                    let pick = rand::thread_rng().gen_range(0..debuggable.len());
                    let node = debuggable[pick].clone();
                    let tree_id = search
                        .journal
                        .root_of(&node.id)
                        .map(|r| r.id.clone())
                        .unwrap_or_else(|| node.id.clone());
                    if !processed_trees.contains(&tree_id)
                        || processed_trees.len() >= viable_trees.len()
                    {
                        processed_trees.insert(tree_id);
                        nodes.push(Some(node));
                        continue;
                    }
                }
            }

            match self.stage_identifier {
                StageIdentifier::Stage4 => {
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!(
                            "Running ablation study variation #{}",
                            search.journal.len() + 1
                        ),
                        "info",
                    ));
                    nodes.push(self.best_stage3_node.clone());
                    continue;
                }
                StageIdentifier::Stage2 => {
                    nodes.push(self.best_stage1_node.clone());
                    continue;
                }
                _ => {}
            }

            // Stage 1/3: best-first search with per-tree dedup.
            if search.journal.good_nodes().is_empty() {
                nodes.push(None);
                continue;
            }
            let Some(best) = best_good.clone() else {
                nodes.push(None);
                continue;
            };
            let tree_id = search
                .journal
                .root_of(&best.id)
                .map(|r| r.id.clone())
                .unwrap_or_else(|| best.id.clone());
            if !processed_trees.contains(&tree_id) || processed_trees.len() >= viable_trees.len() {
                processed_trees.insert(tree_id);
                nodes.push(Some(best));
                continue;
            }

            // Best tree already chosen; try the next-best good nodes.
            let mut ranked: Vec<Node> = search
                .journal
                .good_nodes()
                .iter()
                .map(|n| (*n).clone())
                .collect();
            ranked.sort_by(|a, b| {
                let worst = treeline_core::MetricValue::worst();
                let am = a.metric.as_ref().unwrap_or(&worst);
                let bm = b.metric.as_ref().unwrap_or(&worst);
                bm.partial_cmp(am).unwrap_or(std::cmp::Ordering::Equal)
            });
            let mut pushed = false;
            for candidate in ranked {
                let tree_id = search
                    .journal
                    .root_of(&candidate.id)
                    .map(|r| r.id.clone())
                    .unwrap_or_else(|| candidate.id.clone());
                if !processed_trees.contains(&tree_id)
                    || processed_trees.len() >= viable_trees.len()
                {
                    processed_trees.insert(tree_id);
                    nodes.push(Some(candidate));
                    pushed = true;
                    break;
                }
            }
            if !pushed {
                // Every tree is taken; fall back to drafting.
                nodes.push(None);
            }
        }

        nodes
    }

    /// Drive one iteration: select nodes, submit work, collect results,
    /// update journal and idea state.
    pub async fn step(&mut self, search: &mut JournalSearch) -> EngineResult<()> {
        let best_good = search.get_best_node(self.llm.as_ref(), true, false).await;
        let nodes_to_process = self.select_parallel_nodes(search, best_good);
        debug!(
            "selected nodes: {:?}",
            nodes_to_process
                .iter()
                .map(|n| n.as_ref().map(|n| n.id.clone()))
                .collect::<Vec<_>>()
        );

        let draft_count = nodes_to_process.iter().filter(|n| n.is_none()).count();
        let debug_count = nodes_to_process
            .iter()
            .filter(|n| n.as_ref().map(|n| n.buggy()).unwrap_or(false))
            .count();
        let improve_count = nodes_to_process
            .iter()
            .filter(|n| n.as_ref().map(|n| !n.buggy()).unwrap_or(false))
            .count();
        let mut activities = Vec::new();
        if draft_count > 0 {
            activities.push(format!("{} new draft(s)", draft_count));
        }
        if debug_count > 0 {
            activities.push(format!("{} debugging", debug_count));
        }
        if improve_count > 0 {
            activities.push(format!("{} improving", improve_count));
        }
        self.emitter.emit(&TimelineEvent::run_log(
            format!(
                "Submitting {} node(s): {}",
                nodes_to_process.len(),
                if activities.is_empty() {
                    "processing".to_string()
                } else {
                    activities.join(", ")
                }
            ),
            "info",
        ));

        let memory_summary = search.generate_summary(false);

        let mut submissions: Vec<(String, Option<String>, JoinHandle<EngineResult<serde_json::Value>>)> =
            Vec::new();
        for (idx, node) in nodes_to_process.iter().enumerate() {
            let process_id = format!("worker_{}", idx);
            let gpu_id = self
                .gpu_manager
                .as_ref()
                .and_then(|m| m.acquire(&process_id));

            let is_not_buggy = node
                .as_ref()
                .map(|n| n.is_buggy == Some(false))
                .unwrap_or(false);
            let mut hyperparam_idea = None;
            let mut ablation_idea = None;
            if self.stage_identifier == StageIdentifier::Stage2 && is_not_buggy {
                let base_code = self
                    .best_stage1_node
                    .as_ref()
                    .map(|n| n.code.clone())
                    .unwrap_or_default();
                let idea = self.propose_next_hyperparam_idea(&base_code).await;
                self.tried_hyperparams.insert(idea.name.clone());
                hyperparam_idea = Some(idea);
            } else if self.stage_identifier == StageIdentifier::Stage4 && is_not_buggy {
                let base_code = self
                    .best_stage3_node
                    .as_ref()
                    .map(|n| n.code.clone())
                    .unwrap_or_default();
                let idea = self.propose_next_ablation_idea(&base_code).await;
                self.completed_ablations.insert(idea.name.clone());
                ablation_idea = Some(idea);
            }

            let execution_id = uuid::Uuid::new_v4().simple().to_string();
            info!(
                "registering execution {} for node {} (stage={})",
                execution_id,
                node.as_ref().map(|n| n.id.as_str()).unwrap_or("draft"),
                self.stage_identifier.prefixed_name(),
            );
            self.registry
                .register_execution(&execution_id, node.as_ref());
            self.lock_active().insert(execution_id.clone());

            let user_feedback_payload = node
                .as_ref()
                .filter(|n| n.is_user_feedback)
                .and_then(|n| n.user_feedback_payload.clone())
                .unwrap_or_default();
            let task = NodeTask {
                parent_snapshot: node.as_ref().map(|n| n.to_value()),
                task_desc: self.task_desc.clone(),
                curated_task_desc: self.curated_task_desc.clone(),
                stage_goals: self.stage_goals.clone(),
                evaluation_metric: self.evaluation_metric.clone(),
                cfg: self.cfg.clone(),
                memory_summary: memory_summary.clone(),
                stage_identifier: self.stage_identifier,
                seed_eval: false,
                seed_value: 0,
                seed_aggregation: None,
                hyperparam_idea,
                ablation_idea,
                gpu_id,
                execution_id: execution_id.clone(),
                user_feedback_payload,
                node_index: idx + 1,
            };
            submissions.push((execution_id, Some(process_id), self.spawn_worker(task)));
        }

        self.collect_results(search, submissions).await;
        Ok(())
    }

    fn spawn_worker(
        &self,
        task: NodeTask,
    ) -> JoinHandle<EngineResult<serde_json::Value>> {
        let deps = WorkerDeps {
            registry: self.registry.clone(),
            emitter: self.emitter.clone(),
            llm: self.llm.clone(),
        };
        tokio::spawn(async move { process_node(task, &deps).await })
    }

    /// Collect worker results in submission order, enforcing the per-node
    /// wall-clock timeout. A timeout tears down every remaining in-flight
    /// attempt (and its Codex process group) before the iteration continues.
    async fn collect_results(
        &mut self,
        search: &mut JournalSearch,
        submissions: Vec<(String, Option<String>, JoinHandle<EngineResult<serde_json::Value>>)>,
    ) {
        let total = submissions.len();
        let timeout = Duration::from_secs(self.cfg.exec.timeout_secs);
        let mut abort_rest = false;
        let mut pending: Vec<(String, Option<String>, JoinHandle<EngineResult<serde_json::Value>>)> =
            Vec::new();

        for (i, (execution_id, process_id, handle)) in submissions.into_iter().enumerate() {
            if abort_rest {
                pending.push((execution_id, process_id, handle));
                continue;
            }
            let result = tokio::time::timeout(timeout, handle).await;
            match result {
                Err(_) => {
                    warn!("worker timed out; tearing down remaining executions");
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!(
                            "Node {}/{} timed out after {} s",
                            i + 1,
                            total,
                            timeout.as_secs()
                        ),
                        "warn",
                    ));
                    self.kill_execution(&execution_id).await;
                    abort_rest = true;
                }
                Ok(Err(join_err)) => {
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!(
                            "Node {}/{} crashed unexpectedly: {}. Marking as buggy.",
                            i + 1,
                            total,
                            join_err
                        ),
                        "error",
                    ));
                    self.mark_source_buggy(search, &execution_id);
                }
                Ok(Ok(Err(EngineError::ExecutionTerminated { .. }))) => {
                    info!(
                        "execution {} was terminated intentionally; deferring node re-run",
                        execution_id
                    );
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!("Node {}/{} was terminated intentionally", i + 1, total),
                        "info",
                    ));
                }
                Ok(Ok(Err(e))) => {
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!(
                            "Node {}/{} crashed unexpectedly: {}. Marking as buggy.",
                            i + 1,
                            total,
                            e
                        ),
                        "error",
                    ));
                    self.mark_source_buggy(search, &execution_id);
                }
                Ok(Ok(Ok(value))) => {
                    self.absorb_result(search, &execution_id, value, i + 1, total);
                }
            }
            self.finish_execution(&execution_id, process_id.as_deref());
        }

        // A pool-level timeout invalidates everything still in flight.
        for (execution_id, process_id, handle) in pending {
            handle.abort();
            self.kill_execution(&execution_id).await;
            self.finish_execution(&execution_id, process_id.as_deref());
        }
    }

    fn absorb_result(
        &mut self,
        search: &mut JournalSearch,
        execution_id: &str,
        value: serde_json::Value,
        index: usize,
        total: usize,
    ) {
        let mut node = match Node::from_value(value) {
            Ok(node) => node,
            Err(e) => {
                warn!("failed to rebuild node from worker result: {}", e);
                return;
            }
        };

        // A termination that raced with completion leaves its payload in the
        // registry; the rebuilt node inherits it and is re-selected next
        // iteration.
        if let Some(entry) = self.registry.get_entry(execution_id) {
            if entry.status == RegistryStatus::Terminated {
                if let Some(payload) = entry.payload {
                    info!(
                        "result node {} inherited termination payload from execution {}",
                        node.id, execution_id
                    );
                    node.is_user_feedback = true;
                    node.user_feedback_payload = Some(payload);
                    node.user_feedback_pending = true;
                }
            }
        }

        if self.stage_identifier == StageIdentifier::Stage2 {
            if let Some(name) = &node.hyperparam_name {
                self.tried_hyperparams.insert(name.clone());
            }
        }
        if self.stage_identifier == StageIdentifier::Stage4 {
            if let Some(name) = &node.ablation_name {
                self.completed_ablations.insert(name.clone());
            }
        }

        let buggy = node.buggy();
        let metric_str = node
            .metric
            .as_ref()
            .map(|m| m.to_string().chars().take(50).collect::<String>())
            .unwrap_or_else(|| "N/A".to_string());
        search.append(node);
        if buggy {
            self.emitter.emit(&TimelineEvent::run_log(
                format!("Node {}/{} completed (buggy, will retry)", index, total),
                "info",
            ));
        } else {
            self.emitter.emit(&TimelineEvent::run_log(
                format!(
                    "Node {}/{} completed successfully (metric: {})",
                    index, total, metric_str
                ),
                "info",
            ));
        }
    }

    fn mark_source_buggy(&self, search: &mut JournalSearch, execution_id: &str) {
        if let Some(entry) = self.registry.get_entry(execution_id) {
            if let Some(node) = search.journal.node_by_id_mut(&entry.node_id) {
                node.is_buggy = Some(true);
            }
        }
    }

    async fn kill_execution(&self, execution_id: &str) {
        if let Some(pid) = self.registry.get_pid(execution_id) {
            treeline_codex::terminate_process_group(pid, Duration::from_secs(1)).await;
        }
    }

    fn finish_execution(&self, execution_id: &str, process_id: Option<&str>) {
        self.registry.clear_execution(execution_id);
        self.lock_active().remove(execution_id);
        if let (Some(manager), Some(process_id)) = (self.gpu_manager.as_ref(), process_id) {
            manager.release(process_id);
        }
    }

    /// Stage 2: one new hyperparameter idea, distinct from everything tried.
    async fn propose_next_hyperparam_idea(&self, base_code: &str) -> StageIdea {
        let tried: Vec<String> = self.tried_hyperparams.iter().cloned().collect();
        let prompt = format!(
            "You are an AI researcher conducting hyperparameter tuning for baseline \
             experiments. Based on the current implementation and previous hyperparameter \
             tuning attempts (if any), propose ONE new hyperparameter tuning idea to try next. \
             Start with common knobs (epochs, learning rate, batch size) before proposing \
             exotic changes.\n\nBase code you are working on:\n```python\n{}\n```\n\n\
             Previous attempts: {}\n\nRequirements:\n\
             1. Identify ONE specific hyperparameter to tune.\n\
             2. Ensure the hyperparameter is different from previous attempts.\n\
             3. Keep the model architecture unchanged.",
            base_code,
            if tried.is_empty() {
                "Nothing has been tried yet.".to_string()
            } else {
                tried.join(", ")
            },
        );
        for _ in 0..5 {
            let result: Result<HyperparamTuningIdea, _> = structured_query_as(
                self.llm.as_ref(),
                prompt.clone(),
                None,
                &self.cfg.agent.code.model,
                self.cfg.agent.code.temperature,
            )
            .await;
            if let Ok(idea) = result {
                let name = idea.name.trim().to_string();
                let description = idea.description.trim().to_string();
                if !name.is_empty() && !description.is_empty() {
                    return StageIdea {
                        name,
                        description,
                        tried_names: tried,
                    };
                }
            }
            warn!("hyperparameter idea proposal failed; retrying");
        }
        StageIdea {
            name: "increase epochs".to_string(),
            description: "increase epochs".to_string(),
            tried_names: tried,
        }
    }

    /// Stage 4: one new ablation idea, distinct from everything completed.
    async fn propose_next_ablation_idea(&self, base_code: &str) -> StageIdea {
        let tried: Vec<String> = self.completed_ablations.iter().cloned().collect();
        let prompt = format!(
            "You are an AI researcher conducting ablation studies. Based on the current \
             implementation and previous ablations (if any), propose ONE new ablation study \
             that tests a different aspect of the model.\n\nBase code you are working \
             on:\n```python\n{}\n```\n\nPrevious ablations: {}\n\nRequirements:\n\
             1. Identify ONE specific component/feature to ablate.\n\
             2. Ensure the ablation is different from previous completed or running attempts.\n\
             3. The ablation should be a new idea, not a trivial variation of a previous idea.\n\
             4. Keep the core model architecture unchanged unless the ablation explicitly \
             targets it.",
            base_code,
            if tried.is_empty() {
                "Nothing has been tried yet.".to_string()
            } else {
                tried.join(", ")
            },
        );
        for _ in 0..5 {
            let result: Result<AblationIdea, _> = structured_query_as(
                self.llm.as_ref(),
                prompt.clone(),
                None,
                &self.cfg.agent.code.model,
                self.cfg.agent.code.temperature,
            )
            .await;
            if let Ok(idea) = result {
                let name = idea.name.trim().to_string();
                let description = idea.description.trim().to_string();
                if !name.is_empty() && !description.is_empty() {
                    return StageIdea {
                        name,
                        description,
                        tried_names: tried,
                    };
                }
            }
            warn!("ablation idea proposal failed; retrying");
        }
        StageIdea {
            name: "ablate dropout".to_string(),
            description: "ablate dropout".to_string(),
            tried_names: tried,
        }
    }

    /// Run the best node under multiple seeds; each seed node's parent is
    /// the evaluated node. Returns the collected seed nodes.
    pub async fn run_multi_seed_evaluation(
        &mut self,
        search: &mut JournalSearch,
        node: &Node,
        stage_goals: &str,
    ) -> Vec<Node> {
        let num_seeds = self.cfg.agent.multi_seed_eval.num_seeds;
        let memory_summary = search.generate_summary(false);
        let mut submissions = Vec::new();
        for seed in 0..num_seeds {
            let process_id = format!("seed_{}_worker", seed);
            let gpu_id = self
                .gpu_manager
                .as_ref()
                .and_then(|m| m.acquire(&process_id));

            let mut seeded = node.clone();
            seeded.code = format!("{}{}", seed_prologue(seed), node.code);

            let execution_id = uuid::Uuid::new_v4().simple().to_string();
            info!(
                "registering multi-seed execution {} (seed={}) for node {}",
                execution_id, seed, node.id
            );
            self.registry.register_execution(&execution_id, Some(node));
            self.lock_active().insert(execution_id.clone());

            let task = NodeTask {
                parent_snapshot: Some(seeded.to_value()),
                task_desc: self.task_desc.clone(),
                curated_task_desc: self.curated_task_desc.clone(),
                stage_goals: stage_goals.to_string(),
                evaluation_metric: self.evaluation_metric.clone(),
                cfg: self.cfg.clone(),
                memory_summary: memory_summary.clone(),
                stage_identifier: self.stage_identifier,
                seed_eval: true,
                seed_value: seed,
                seed_aggregation: None,
                hyperparam_idea: None,
                ablation_idea: None,
                gpu_id,
                execution_id: execution_id.clone(),
                user_feedback_payload: String::new(),
                node_index: seed as usize + 1,
            };
            submissions.push((execution_id, Some(process_id), self.spawn_worker(task)));
        }

        let before = search.journal.len();
        self.collect_results(search, submissions).await;
        let seed_nodes: Vec<Node> = search.journal.nodes[before..]
            .iter()
            .filter(|n| n.is_seed_node)
            .cloned()
            .collect();

        if !seed_nodes.is_empty() {
            self.run_seed_aggregation(search, node, &seed_nodes, stage_goals)
                .await;
        }
        seed_nodes
    }

    /// One follow-up job that summarises across-seed results.
    async fn run_seed_aggregation(
        &mut self,
        search: &mut JournalSearch,
        node: &Node,
        seed_nodes: &[Node],
        stage_goals: &str,
    ) {
        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        self.registry.register_execution(&execution_id, Some(node));
        self.lock_active().insert(execution_id.clone());
        let memory_summary = search.generate_summary(false);
        let task = NodeTask {
            parent_snapshot: Some(node.to_value()),
            task_desc: self.task_desc.clone(),
            curated_task_desc: self.curated_task_desc.clone(),
            stage_goals: stage_goals.to_string(),
            evaluation_metric: self.evaluation_metric.clone(),
            cfg: self.cfg.clone(),
            memory_summary,
            stage_identifier: self.stage_identifier,
            seed_eval: false,
            seed_value: 0,
            seed_aggregation: Some(SeedAggregationPayload {
                seed_nodes: seed_nodes.iter().map(Node::to_value).collect(),
            }),
            hyperparam_idea: None,
            ablation_idea: None,
            gpu_id: None,
            execution_id: execution_id.clone(),
            user_feedback_payload: String::new(),
            node_index: 1,
        };
        let submissions = vec![(execution_id, None, self.spawn_worker(task))];
        self.collect_results(search, submissions).await;
    }

    /// Release GPUs and drop the in-flight bookkeeping. Idempotent.
    pub fn cleanup(&self) {
        if let Some(manager) = &self.gpu_manager {
            manager.release_all();
        }
        let ids: Vec<String> = self.lock_active().drain().collect();
        for execution_id in ids {
            self.registry.clear_execution(&execution_id);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.active_execution_ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Define the run-wide evaluation metric once, at agent construction.
async fn define_global_metric(
    llm: &dyn LlmClient,
    cfg: &Config,
    curated_task_desc: &str,
) -> EvaluationMetricSpec {
    let prompt = format!(
        "You are an AI researcher setting up experiments. Propose a single evaluation metric \
         that would be useful for analyzing the performance of solutions for this research \
         task. Validation loss is tracked separately, so do not propose it.\n\n\
         Research idea:\n{}",
        curated_task_desc,
    );
    let result: Result<EvaluationMetricSpecResponse, _> = structured_query_as(
        llm,
        prompt,
        None,
        &cfg.agent.code.model,
        cfg.agent.code.temperature,
    )
    .await;
    match result {
        Ok(spec) => EvaluationMetricSpec {
            name: spec.name,
            maximize: spec.maximize,
            description: spec.description,
        },
        Err(e) => {
            warn!("evaluation metric definition failed ({}); using default", e);
            EvaluationMetricSpec {
                name: "validation_metric".to_string(),
                maximize: true,
                description: "Primary validation metric of the experiment.".to_string(),
            }
        }
    }
}

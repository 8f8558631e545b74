//! The stage manager: drives the staged experiment lifecycle.
//!
//! Owns the stage metas and their journals, runs sub-stage iterations
//! through a parallel agent, evaluates completion, consumes operator skip
//! requests, runs the multi-seed pass when a main stage completes, and
//! persists checkpoints.

use crate::error::{EngineError, EngineResult};
use crate::journal_search::JournalSearch;
use crate::parallel::ParallelAgent;
use crate::registry::ExecutionRegistry;
use crate::stage_control::{StageControl, StageSkipCoordinator};
use crate::stages::{controller_for, default_goals_for, StageContext};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use treeline_core::{
    Config, Journal, Node, SkipWindowState, StageCompletedPayload, StageIdentifier, StageMeta,
    StageProgressPayload, StageSkipWindowPayload, SubstageSummaryPayload, TaskDescription,
    TimelineEvent,
};
use treeline_llm::{structured_query_as, LlmClient, SubstageGoalResponse};
use treeline_telemetry::EventEmitter;

/// Records a transition between (sub-)stages and the reasoning.
#[derive(Clone, Debug, Serialize)]
pub struct StageTransition {
    pub from_stage: String,
    pub to_stage: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PhaseDefinition {
    pub phase_id: String,
    pub main_stage_number: u32,
    pub stage_slug: String,
    pub goals: String,
}

impl PhaseDefinition {
    fn display_name(&self) -> String {
        format!("Stage {}: {}", self.main_stage_number, self.stage_slug)
    }
}

pub struct StageManager {
    cfg: Config,
    task_desc: TaskDescription,
    emitter: EventEmitter,
    registry: Arc<ExecutionRegistry>,
    control: Arc<StageControl>,
    llm: Arc<dyn LlmClient>,

    stages: Vec<StageMeta>,
    current_stage: Option<StageMeta>,
    journals: HashMap<String, JournalSearch>,
    journal_history: HashMap<String, Vec<JournalSearch>>,
    stage_history: Vec<StageTransition>,
    completed_stages: HashSet<String>,
    final_progress_emitted: HashSet<String>,
    substage_completed_emitted: HashSet<String>,
    attempt_iteration_by_stage: HashMap<String, usize>,
    forced_completion_reasons: HashMap<String, String>,
    stage_skip_states: HashMap<String, bool>,
    completion_cache: HashMap<String, (bool, String)>,
    phase_plan: Vec<PhaseDefinition>,
    failure_reason: Option<String>,
}

pub type StepCallback<'a> = &'a mut dyn FnMut(&StageMeta, &JournalSearch);

impl StageManager {
    pub fn new(
        cfg: Config,
        task_desc: TaskDescription,
        emitter: EventEmitter,
        registry: Arc<ExecutionRegistry>,
        control: Arc<StageControl>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let mut manager = Self {
            cfg,
            task_desc,
            emitter,
            registry,
            control,
            llm,
            stages: Vec::new(),
            current_stage: None,
            journals: HashMap::new(),
            journal_history: HashMap::new(),
            stage_history: Vec::new(),
            completed_stages: HashSet::new(),
            final_progress_emitted: HashSet::new(),
            substage_completed_emitted: HashSet::new(),
            attempt_iteration_by_stage: HashMap::new(),
            forced_completion_reasons: HashMap::new(),
            stage_skip_states: HashMap::new(),
            completion_cache: HashMap::new(),
            phase_plan: Vec::new(),
            failure_reason: None,
        };
        manager.create_initial_stage();
        manager.control.reset_stage_state();
        manager
    }

    pub fn current_stage(&self) -> Option<&StageMeta> {
        self.current_stage.as_ref()
    }

    pub fn journal(&self, stage_name: &str) -> Option<&JournalSearch> {
        self.journals.get(stage_name)
    }

    pub fn has_stage_completed(&self, stage_name: &str) -> bool {
        self.completed_stages.contains(stage_name)
    }

    /// Why the run ended unsuccessfully, when it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn attempt_iteration(&self, stage_name: &str) -> usize {
        self.attempt_iteration_by_stage
            .get(stage_name)
            .copied()
            .unwrap_or(0)
    }

    fn create_initial_stage(&mut self) {
        let identifier = StageIdentifier::Stage1;
        let meta = StageMeta {
            identifier,
            goals: default_goals_for(identifier).to_string(),
            max_iterations: self.cfg.agent.stages.max_iters_for(identifier),
            num_drafts: self.cfg.agent.search.num_drafts,
        };
        self.install_stage(meta.clone());
        self.current_stage = Some(meta);
    }

    fn install_stage(&mut self, meta: StageMeta) {
        let name = meta.name();
        self.journals.insert(
            name.clone(),
            JournalSearch::new(
                Journal::new(name.clone(), non_empty(&self.cfg.telemetry.run_id)),
                self.emitter.clone(),
                self.cfg.agent.feedback.model.clone(),
                self.cfg.agent.feedback.temperature,
            ),
        );
        self.register_phase_definition(&meta);
        self.stages.push(meta);
    }

    fn register_phase_definition(&mut self, meta: &StageMeta) {
        let name = meta.name();
        if self.phase_plan.iter().any(|p| p.phase_id == name) {
            return;
        }
        self.phase_plan.push(PhaseDefinition {
            phase_id: name,
            main_stage_number: meta.number(),
            stage_slug: meta.slug().to_string(),
            goals: meta.goals.clone(),
        });
    }

    fn phase_definition(&self, stage_name: &str) -> Option<&PhaseDefinition> {
        self.phase_plan.iter().find(|p| p.phase_id == stage_name)
    }

    /// The research-idea preamble, curated with stage-specific extras.
    fn curate_task_desc(&self, meta: &StageMeta) -> String {
        let mut out = self.task_desc.render();
        match meta.identifier {
            StageIdentifier::Stage3 if !self.task_desc.experiments.is_empty() => {
                out.push_str(&format!(
                    "Experiment Plan: {}\n",
                    self.task_desc.experiments.join("\n")
                ));
            }
            StageIdentifier::Stage4 if !self.task_desc.risk_factors_and_limitations.is_empty() => {
                out.push_str(&format!(
                    "Risk Factors and Limitations: {}\n",
                    self.task_desc.risk_factors_and_limitations.join("\n")
                ));
            }
            _ => {}
        }
        out
    }

    /// Evaluate and publish skip eligibility; emits window open/close events
    /// on transitions.
    async fn publish_stage_control_state(&mut self, meta: &StageMeta) {
        let stage_name = meta.name();
        let Some(search) = self.journals.get_mut(&stage_name) else {
            return;
        };
        let mut controller = controller_for(meta);
        let mut ctx = StageContext {
            cfg: &self.cfg,
            goals: &meta.goals,
            max_iterations: meta.max_iterations,
            search,
            llm: self.llm.as_ref(),
            completion_cache: &mut self.completion_cache,
        };
        controller.reset_skip_state(&mut ctx).await;
        let (can_skip, reason) = controller.skip_state();
        info!(
            "stage {} skip state evaluated: can_skip={} reason={}",
            stage_name, can_skip, reason
        );
        self.update_stage_skip_state(&stage_name, can_skip, &reason);
        self.control
            .publish_stage_state(&stage_name, meta.number(), can_skip, Some(&reason));
    }

    fn emit_skip_window_event(&self, stage_name: &str, state: SkipWindowState, reason: &str) {
        self.emitter
            .emit(&TimelineEvent::StageSkipWindow(StageSkipWindowPayload {
                stage: stage_name.to_string(),
                state,
                timestamp: Utc::now().to_rfc3339(),
                reason: Some(reason.to_string()),
            }));
    }

    fn update_stage_skip_state(&mut self, stage_name: &str, can_skip: bool, reason: &str) {
        let previous = self.stage_skip_states.get(stage_name).copied().unwrap_or(false);
        if can_skip && !previous {
            self.stage_skip_states.insert(stage_name.to_string(), true);
            self.emit_skip_window_event(stage_name, SkipWindowState::Opened, reason);
            info!("stage {} skip window opened ({})", stage_name, reason);
        } else if !can_skip && previous {
            self.stage_skip_states.insert(stage_name.to_string(), false);
            self.emit_skip_window_event(stage_name, SkipWindowState::Closed, reason);
            info!("stage {} skip window closed ({})", stage_name, reason);
        } else {
            self.stage_skip_states
                .insert(stage_name.to_string(), can_skip);
        }
    }

    fn clear_stage_skip_state(&mut self, stage_name: &str, reason: &str) {
        if self.stage_skip_states.get(stage_name).copied().unwrap_or(false) {
            self.emit_skip_window_event(stage_name, SkipWindowState::Closed, reason);
            info!("stage {} skip window force-closed ({})", stage_name, reason);
        }
        self.stage_skip_states.remove(stage_name);
    }

    fn clear_all_stage_skip_states(&mut self, reason: &str) {
        let open: Vec<String> = self
            .stage_skip_states
            .iter()
            .filter(|(_, is_open)| **is_open)
            .map(|(name, _)| name.clone())
            .collect();
        for stage_name in open {
            self.emit_skip_window_event(&stage_name, SkipWindowState::Closed, reason);
        }
        self.stage_skip_states.clear();
    }

    /// Best implementation of a completed (sub-)stage, detached for reuse as
    /// a root in the next stage's journal.
    async fn get_best_implementation(&mut self, stage_name: &str) -> Option<Node> {
        if let Some(search) = self.journals.get_mut(stage_name) {
            if let Some(best) = search.get_best_node(self.llm.as_ref(), true, false).await {
                return Some(detach(best));
            }
        }
        let history_len = self
            .journal_history
            .get(stage_name)
            .map(|h| h.len())
            .unwrap_or(0);
        for idx in (0..history_len).rev() {
            let best = {
                let search = self.journal_history.get_mut(stage_name)?.get_mut(idx)?;
                search.get_best_node(self.llm.as_ref(), true, false).await
            };
            if let Some(best) = best {
                return Some(detach(best));
            }
        }
        None
    }

    async fn check_substage_completion(&mut self, meta: &StageMeta) -> (bool, String) {
        let stage_name = meta.name();
        let node_count = self
            .journals
            .get(&stage_name)
            .map(|s| s.journal.len())
            .unwrap_or(0);
        if node_count >= meta.max_iterations {
            info!("stage {} sub-stage completed: reached max iterations", stage_name);
            return (true, "Reached max iterations".to_string());
        }
        let Some(search) = self.journals.get_mut(&stage_name) else {
            return (false, "Journal missing".to_string());
        };
        let controller = controller_for(meta);
        let mut ctx = StageContext {
            cfg: &self.cfg,
            goals: &meta.goals,
            max_iterations: meta.max_iterations,
            search,
            llm: self.llm.as_ref(),
            completion_cache: &mut self.completion_cache,
        };
        controller.evaluate_substage_completion(&mut ctx).await
    }

    async fn check_stage_completion(&mut self, meta: &StageMeta) -> (bool, String) {
        let stage_name = meta.name();
        let node_count = self
            .journals
            .get(&stage_name)
            .map(|s| s.journal.len())
            .unwrap_or(0);
        if node_count >= meta.max_iterations {
            info!("stage {} completed: reached max iterations", stage_name);
            if meta.identifier == StageIdentifier::Stage1 {
                // The baseline stage exhausting its budget without a working
                // implementation ends the whole experiment.
                error!(
                    "initial stage {} did not find a working implementation after {} iterations",
                    stage_name, meta.max_iterations
                );
                self.current_stage = None;
                self.failure_reason = Some(format!(
                    "Could not find working implementation in initial stage after {} iterations",
                    meta.max_iterations
                ));
                return (true, "Failed to find working implementation".to_string());
            }
            return (true, "Reached max iterations".to_string());
        }

        if let Some(reason) = self.forced_completion_reasons.remove(&stage_name) {
            info!("stage {} marked complete via override: {}", stage_name, reason);
            return (true, reason);
        }

        let Some(search) = self.journals.get_mut(&stage_name) else {
            return (false, "Journal missing".to_string());
        };
        let controller = controller_for(meta);
        let mut ctx = StageContext {
            cfg: &self.cfg,
            goals: &meta.goals,
            max_iterations: meta.max_iterations,
            search,
            llm: self.llm.as_ref(),
            completion_cache: &mut self.completion_cache,
        };
        controller.evaluate_stage_completion(&mut ctx).await
    }

    /// LLM-generated goals for the next sub-stage; deterministic fallback.
    async fn generate_substage_goal(&mut self, meta: &StageMeta) -> String {
        let stage_name = meta.name();
        let progress_summary = self
            .journals
            .get_mut(&stage_name)
            .map(|s| s.generate_summary(false))
            .unwrap_or_default();
        let main_goal = default_goals_for(meta.identifier);
        let prompt = format!(
            "Based on the current experimental progress, generate focused goals for the next \
             sub-stage.\n\nMain Stage Goals:\n{}\n\nCurrent Progress:\n{}\n\n\
             Generate specific, actionable sub-stage goals that:\n\
             1. Address current issues and limitations\n\
             2. Build on recent progress\n\
             3. Move towards main stage goals\n\
             4. Are concrete and measurable",
            main_goal, progress_summary,
        );
        let result: Result<SubstageGoalResponse, _> = structured_query_as(
            self.llm.as_ref(),
            prompt,
            None,
            &self.cfg.agent.feedback.model,
            self.cfg.agent.feedback.temperature,
        )
        .await;
        match result {
            Ok(response) => response.goals.trim().to_string(),
            Err(e) => {
                warn!("error generating sub-stage goals: {}", e);
                "Continue progress on main stage objectives while addressing current issues."
                    .to_string()
            }
        }
    }

    async fn create_next_substage(&mut self, current: &StageMeta) -> StageMeta {
        let sub_goal = self.generate_substage_goal(current).await;
        StageMeta {
            identifier: current.identifier,
            goals: format!(
                "Main stage goals:\n{}\n\nSub-stage goals:\n{}",
                default_goals_for(current.identifier),
                sub_goal
            ),
            max_iterations: self.cfg.agent.stages.max_iters_for(current.identifier),
            num_drafts: 0,
        }
    }

    fn create_next_main_stage(&self, current: &StageMeta) -> Option<StageMeta> {
        let next = current.identifier.next()?;
        Some(StageMeta {
            identifier: next,
            goals: default_goals_for(next).to_string(),
            max_iterations: self.cfg.agent.stages.max_iters_for(next),
            num_drafts: 0,
        })
    }

    /// Preserve the current journal before a new sub-stage replaces it.
    fn stash_current_journal(&mut self, stage_name: &str) {
        if let Some(search) = self.journals.remove(stage_name) {
            self.journal_history
                .entry(stage_name.to_string())
                .or_default()
                .push(search);
        }
    }

    /// Seed a new sub-stage with the previous stage's best node. Returns
    /// false when a previous best was expected but missing.
    async fn prepare_substage(&mut self, meta: &StageMeta) -> bool {
        let Some(prev_stage) = self.stage_history.last().map(|t| t.from_stage.clone()) else {
            return true;
        };
        debug!("seeding {} from previous stage {}", meta.name(), prev_stage);
        let Some(prev_best) = self.get_best_implementation(&prev_stage).await else {
            error!(
                "no previous best implementation found for {}; finishing the experiment",
                meta.name()
            );
            return false;
        };
        if let Some(search) = self.journals.get_mut(&meta.name()) {
            search.append(prev_best);
        }
        true
    }

    fn emit_final_progress_if_needed(&mut self, meta: &StageMeta) {
        let stage_name = meta.name();
        if self.final_progress_emitted.contains(&stage_name) {
            return;
        }
        let Some(search) = self.journals.get(&stage_name) else {
            return;
        };
        let best_metric = search
            .best_good_node_by_metric()
            .and_then(|n| n.metric.as_ref())
            .map(|m| m.to_string());
        self.emitter
            .emit(&TimelineEvent::RunStageProgress(StageProgressPayload {
                stage: stage_name.clone(),
                iteration: search.journal.len(),
                max_iterations: meta.max_iterations,
                progress: 1.0,
                total_nodes: search.journal.len(),
                buggy_nodes: search.journal.buggy_nodes().len(),
                good_nodes: search.journal.good_nodes().len(),
                best_metric,
                is_seed_node: false,
                is_seed_agg_node: false,
            }));
        self.final_progress_emitted.insert(stage_name);
    }

    fn emit_substage_completed_event(&mut self, meta: &StageMeta, reason: &str) {
        let stage_name = meta.name();
        if self.substage_completed_emitted.contains(&stage_name) {
            return;
        }
        let Some(search) = self.journals.get(&stage_name) else {
            return;
        };
        let best_metric = search
            .best_good_node_by_metric()
            .and_then(|n| n.metric.as_ref())
            .map(|m| m.to_string());
        let mut summary = serde_json::json!({
            "goals": meta.goals,
            "total_nodes": search.journal.len(),
            "buggy_nodes": search.journal.buggy_nodes().len(),
            "good_nodes": search.journal.good_nodes().len(),
            "best_metric": best_metric,
            "feedback": reason,
        });
        if let Some(phase) = self.phase_definition(&stage_name) {
            let plan_index = self
                .phase_plan
                .iter()
                .position(|p| p.phase_id == stage_name)
                .unwrap_or(0);
            let phase_summary = serde_json::json!({
                "phase_id": phase.phase_id,
                "label": phase.display_name(),
                "completed_phases": plan_index + 1,
                "goals": phase.goals,
            });
            summary["phase_summary"] = phase_summary.clone();
            self.emitter
                .emit(&TimelineEvent::SubstageSummary(SubstageSummaryPayload {
                    stage: stage_name.clone(),
                    summary: phase_summary,
                }));
        }
        self.emitter
            .emit(&TimelineEvent::SubstageCompleted(StageCompletedPayload {
                stage: stage_name.clone(),
                main_stage_number: meta.number(),
                reason: reason.to_string(),
                summary,
            }));
        self.substage_completed_emitted.insert(stage_name);
    }

    /// Multi-seed evaluation + aggregation after a main stage completes.
    async fn perform_multi_seed_eval(
        &mut self,
        agent: &mut ParallelAgent,
        meta: &StageMeta,
        step_callback: StepCallback<'_>,
    ) -> bool {
        let stage_name = meta.name();
        let Some(best_node) = self.get_best_implementation(&stage_name).await else {
            error!(
                "no best node found for {} during multi-seed eval; finishing the experiment",
                stage_name
            );
            return false;
        };
        let goals = meta.goals.clone();
        if let Some(search) = self.journals.get_mut(&stage_name) {
            let seed_nodes = agent
                .run_multi_seed_evaluation(search, &best_node, &goals)
                .await;
            info!(
                "stage {} multi-seed eval done ({} seed node(s))",
                stage_name,
                seed_nodes.len()
            );
            step_callback(meta, search);
        }
        true
    }

    fn save_checkpoint(&self) {
        let Some(meta) = &self.current_stage else {
            warn!("cannot save checkpoint: no current stage");
            return;
        };
        let dir = self
            .cfg
            .run_logs_dir()
            .join(format!("stage_{}", meta.name()));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("failed creating checkpoint dir {}: {}", dir.display(), e);
            return;
        }
        let journals: HashMap<&String, &Journal> = self
            .journals
            .iter()
            .map(|(name, search)| (name, &search.journal))
            .collect();
        let checkpoint = serde_json::json!({
            "journals": journals,
            "stage_history": self.stage_history,
            "task_desc": self.task_desc,
            "cfg": self.cfg,
            "workspace_dir": self.cfg.workspace_dir,
            "current_stage": meta,
        });
        let path = dir.join("checkpoint.json");
        info!("saving checkpoint to {}", path.display());
        if let Err(e) = std::fs::write(
            &path,
            serde_json::to_string_pretty(&checkpoint).unwrap_or_default(),
        ) {
            warn!("failed writing checkpoint: {}", e);
        }
    }

    async fn create_agent_for_stage(&mut self, meta: &StageMeta) -> EngineResult<ParallelAgent> {
        let mut stage_cfg = self.cfg.clone();
        stage_cfg.agent.search.num_drafts = meta.num_drafts;

        let mut curated = self.curate_task_desc(meta);
        curated.push_str(&format!("\n\nCurrent Main Stage: {}\n", meta.slug()));
        curated.push_str(&format!("Sub-stage goals: {}", meta.goals));

        let (best_stage1, best_stage3) = match meta.identifier {
            StageIdentifier::Stage2 => {
                let name = self.latest_substage_name(StageIdentifier::Stage1)?;
                (self.get_best_implementation(&name).await, None)
            }
            StageIdentifier::Stage4 => {
                let name = self.latest_substage_name(StageIdentifier::Stage3)?;
                (None, self.get_best_implementation(&name).await)
            }
            _ => (None, None),
        };

        ParallelAgent::new(
            curated,
            meta.goals.clone(),
            self.task_desc.clone(),
            stage_cfg,
            meta.identifier,
            best_stage1,
            best_stage3,
            self.emitter.clone(),
            self.registry.clone(),
            self.llm.clone(),
        )
        .await
    }

    fn latest_substage_name(&self, identifier: StageIdentifier) -> EngineResult<String> {
        self.stages
            .iter()
            .rev()
            .find(|m| m.identifier == identifier)
            .map(StageMeta::name)
            .ok_or_else(|| {
                EngineError::internal(format!(
                    "no {} substages found",
                    identifier.prefixed_name()
                ))
            })
    }

    /// Run the experiment through the generated stages.
    pub async fn run(
        &mut self,
        step_callback: StepCallback<'_>,
        iteration_started_callback: StepCallback<'_>,
    ) -> EngineResult<()> {
        while let Some(stage) = self.current_stage.clone() {
            info!("starting main stage: {}", stage.slug());
            self.run_stage(stage, step_callback, iteration_started_callback)
                .await?;
            self.advance_to_next_main_stage().await;
        }
        Ok(())
    }

    async fn advance_to_next_main_stage(&mut self) {
        if self.current_stage.is_none() {
            return;
        }
        let Some(last) = self.stages.last().cloned() else {
            return;
        };
        match self.create_next_main_stage(&last) {
            Some(next) => {
                self.stage_history.push(StageTransition {
                    from_stage: last.name(),
                    to_stage: next.name(),
                    reason: format!("Moving to {}", next.name()),
                });
                self.install_stage(next.clone());
                self.current_stage = Some(next.clone());
                self.publish_stage_control_state(&next).await;
            }
            None => {
                info!("no more stages to run; exiting the loop");
                self.current_stage = None;
                self.clear_all_stage_skip_states("All stages completed");
                self.control.clear_stage_state();
            }
        }
    }

    async fn run_stage(
        &mut self,
        initial_substage: StageMeta,
        step_callback: StepCallback<'_>,
        iteration_started_callback: StepCallback<'_>,
    ) -> EngineResult<()> {
        let mut current: Option<StageMeta> = Some(initial_substage);
        if let Some(meta) = &current {
            let meta = meta.clone();
            self.publish_stage_control_state(&meta).await;
        }
        while let Some(meta) = current.clone() {
            info!(
                "starting sub-stage {} (max iterations: {})",
                meta.name(),
                meta.max_iterations
            );
            self.emitter.emit(&TimelineEvent::run_log(
                format!(
                    "Starting sub-stage {} (max iterations: {})",
                    meta.name(),
                    meta.max_iterations
                ),
                "info",
            ));

            let mut agent = self.create_agent_for_stage(&meta).await?;
            if !self.prepare_substage(&meta).await {
                self.clear_stage_skip_state(&meta.name(), "Stage preparation failed");
                self.current_stage = None;
                agent.cleanup();
                break;
            }

            let (main_done, next_substage) = self
                .run_substage(&meta, &mut agent, step_callback, iteration_started_callback)
                .await?;
            agent.cleanup();
            current = if main_done { None } else { next_substage };
        }

        if self.current_stage.is_some() {
            self.save_checkpoint();
        } else {
            self.clear_all_stage_skip_states("Experiment halted");
            self.control.clear_stage_state();
        }
        Ok(())
    }

    async fn run_substage(
        &mut self,
        meta: &StageMeta,
        agent: &mut ParallelAgent,
        step_callback: StepCallback<'_>,
        iteration_started_callback: StepCallback<'_>,
    ) -> EngineResult<(bool, Option<StageMeta>)> {
        let stage_name = meta.name();
        let coordinator = StageSkipCoordinator::new(
            self.control.clone(),
            self.registry.clone(),
            meta.identifier,
        );

        loop {
            self.publish_stage_control_state(meta).await;

            let (skip_requested, skip_reason) = coordinator.consume_pending_request();
            let skip_reason =
                skip_reason.unwrap_or_else(|| "Stage skipped by operator.".to_string());

            // An exhausted iteration budget completes the stage without
            // dispatching further work.
            let budget_exhausted = self
                .journals
                .get(&stage_name)
                .map(|s| s.journal.len())
                .unwrap_or(0)
                >= meta.max_iterations;

            if !skip_requested && !budget_exhausted {
                let iter = self
                    .attempt_iteration_by_stage
                    .entry(stage_name.clone())
                    .or_insert(0);
                *iter += 1;
                let current_iter = *iter;
                self.emitter.emit(&TimelineEvent::run_log(
                    format!(
                        "Stage {}: Iteration {}/{}",
                        stage_name, current_iter, meta.max_iterations
                    ),
                    "info",
                ));

                if let Some(search) = self.journals.get_mut(&stage_name) {
                    iteration_started_callback(meta, search);
                    if let Err(e) = agent.step(search).await {
                        match e {
                            EngineError::GpuShortage { .. } => return Err(e),
                            other => {
                                warn!("agent step failed: {}", other);
                                self.emitter.emit(&TimelineEvent::run_log(
                                    format!("Iteration error: {}", other),
                                    "error",
                                ));
                            }
                        }
                    }
                    step_callback(meta, search);
                }
            } else if skip_requested {
                info!("skip requested for stage {}: {}", stage_name, skip_reason);
                agent.abort_active_executions(&skip_reason);
                self.forced_completion_reasons
                    .insert(stage_name.clone(), skip_reason.clone());
                self.emitter.emit(&TimelineEvent::run_log(
                    format!("Skipping stage {}: {}", stage_name, skip_reason),
                    "warn",
                ));
            }

            let (substage_complete, substage_feedback) = if skip_requested {
                (true, skip_reason.clone())
            } else {
                self.check_substage_completion(meta).await
            };
            let (main_complete, main_feedback) = if skip_requested {
                // Burn the forced reason recorded above.
                self.forced_completion_reasons.remove(&stage_name);
                (true, skip_reason.clone())
            } else {
                self.check_stage_completion(meta).await
            };
            debug!(
                "stage {} completion: substage={} main={}",
                stage_name, substage_complete, main_complete
            );

            if substage_complete {
                self.emit_substage_completed_event(meta, &substage_feedback);
            }

            if main_complete {
                self.completed_stages.insert(stage_name.clone());
                self.clear_stage_skip_state(&stage_name, &main_feedback);
                self.emit_final_progress_if_needed(meta);
                if !self.substage_completed_emitted.contains(&stage_name) {
                    self.emit_substage_completed_event(meta, &main_feedback);
                }
                self.emit_stage_completed_event(meta, &main_feedback);
                if self.current_stage.is_some() {
                    let _ = self.perform_multi_seed_eval(agent, meta, step_callback).await;
                }
                return Ok((true, None));
            }

            if substage_complete {
                let next = self.create_next_substage(meta).await;
                self.stage_history.push(StageTransition {
                    from_stage: stage_name.clone(),
                    to_stage: next.name(),
                    reason: substage_feedback,
                });
                self.stash_current_journal(&stage_name);
                self.install_stage(next.clone());
                return Ok((false, Some(next)));
            }
        }
    }

    /// The main-stage boundary event; sub-stage boundaries emit only the
    /// substage-completed kind.
    fn emit_stage_completed_event(&mut self, meta: &StageMeta, reason: &str) {
        let Some(search) = self.journals.get(&meta.name()) else {
            return;
        };
        let best_metric = search
            .best_good_node_by_metric()
            .and_then(|n| n.metric.as_ref())
            .map(|m| m.to_string());
        self.emitter
            .emit(&TimelineEvent::StageCompleted(StageCompletedPayload {
                stage: meta.name(),
                main_stage_number: meta.number(),
                reason: reason.to_string(),
                summary: serde_json::json!({
                    "total_nodes": search.journal.len(),
                    "good_nodes": search.journal.good_nodes().len(),
                    "buggy_nodes": search.journal.buggy_nodes().len(),
                    "best_metric": best_metric,
                }),
            }));
    }
}

fn detach(mut node: Node) -> Node {
    node.parent = None;
    node
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

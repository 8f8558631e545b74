//! Stage controllers: per-stage completion predicates and skip eligibility.
//!
//! Completion queries that consult the LLM are memoised on the best node's
//! identity, its metric value, and the goals text; the cache is owned by the
//! stage manager and shared across controller instantiations.

pub mod stage1_baseline;
pub mod stage2_tuning;
pub mod stage3_plotting;
pub mod stage4_ablation;

use crate::journal_search::JournalSearch;
use std::collections::HashMap;
use treeline_core::{Config, StageIdentifier, StageMeta};
use treeline_llm::LlmClient;

pub use stage1_baseline::Stage1Baseline;
pub use stage2_tuning::Stage2Tuning;
pub use stage3_plotting::Stage3Plotting;
pub use stage4_ablation::Stage4Ablation;

/// Everything a completion/skip query needs, value-passed per call.
pub struct StageContext<'a> {
    pub cfg: &'a Config,
    pub goals: &'a str,
    pub max_iterations: usize,
    pub search: &'a mut JournalSearch,
    pub llm: &'a dyn LlmClient,
    pub completion_cache: &'a mut HashMap<String, (bool, String)>,
}

#[async_trait::async_trait]
pub trait StageController: Send {
    fn identifier(&self) -> StageIdentifier;

    async fn evaluate_substage_completion(&self, ctx: &mut StageContext<'_>) -> (bool, String);

    async fn evaluate_stage_completion(&self, ctx: &mut StageContext<'_>) -> (bool, String);

    /// Recompute skip eligibility from the journal state.
    async fn reset_skip_state(&mut self, ctx: &mut StageContext<'_>);

    /// The last computed `(can_skip, reason)` pair.
    fn skip_state(&self) -> (bool, String);
}

pub fn controller_for(meta: &StageMeta) -> Box<dyn StageController> {
    match meta.identifier {
        StageIdentifier::Stage1 => Box::new(Stage1Baseline::new()),
        StageIdentifier::Stage2 => Box::new(Stage2Tuning::new()),
        StageIdentifier::Stage3 => Box::new(Stage3Plotting::new()),
        StageIdentifier::Stage4 => Box::new(Stage4Ablation::new()),
    }
}

pub fn default_goals_for(identifier: StageIdentifier) -> &'static str {
    match identifier {
        StageIdentifier::Stage1 => Stage1Baseline::DEFAULT_GOALS,
        StageIdentifier::Stage2 => Stage2Tuning::DEFAULT_GOALS,
        StageIdentifier::Stage3 => Stage3Plotting::DEFAULT_GOALS,
        StageIdentifier::Stage4 => Stage4Ablation::DEFAULT_GOALS,
    }
}

/// Shared skip-eligibility bookkeeping for the four controllers.
#[derive(Clone, Debug)]
pub struct SkipState {
    pub can_be_skipped: bool,
    pub reason: String,
}

impl Default for SkipState {
    fn default() -> Self {
        Self {
            can_be_skipped: false,
            reason: "Stage cannot be skipped yet.".to_string(),
        }
    }
}

/// Memoised LLM completion query shared by the stage implementations.
pub(crate) async fn cached_completion_evaluation(
    ctx: &mut StageContext<'_>,
    cache_key: String,
    prompt: String,
) -> (bool, String) {
    if let Some(cached) = ctx.completion_cache.get(&cache_key) {
        tracing::debug!("completion cache HIT for {}", cache_key);
        return cached.clone();
    }
    let evaluation: Result<treeline_llm::StageCompletionEvaluation, _> =
        treeline_llm::structured_query_as(
            ctx.llm,
            prompt,
            None,
            &ctx.cfg.agent.feedback.model,
            ctx.cfg.agent.feedback.temperature,
        )
        .await;
    let result = match evaluation {
        Ok(evaluation) if evaluation.is_complete => {
            let reasoning = if evaluation.reasoning.trim().is_empty() {
                "sub-stage complete".to_string()
            } else {
                evaluation.reasoning
            };
            (true, reasoning)
        }
        Ok(evaluation) => (
            false,
            format!("Missing criteria: {}", evaluation.missing_criteria.join(", ")),
        ),
        Err(e) => {
            tracing::warn!("stage completion evaluation failed: {}", e);
            (false, "Completion evaluation unavailable".to_string())
        }
    };
    ctx.completion_cache.insert(cache_key, result.clone());
    result
}

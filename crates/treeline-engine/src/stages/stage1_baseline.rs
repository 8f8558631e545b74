//! Stage 1: find a working baseline implementation.

use super::{cached_completion_evaluation, SkipState, StageContext, StageController};
use tracing::info;
use treeline_core::StageIdentifier;

pub struct Stage1Baseline {
    skip: SkipState,
}

impl Stage1Baseline {
    pub const DEFAULT_GOALS: &'static str = "- Focus on getting basic working implementation\n\
         - Use a dataset appropriate to the experiment\n\
         - Aim for basic functional correctness\n\
         - If you are given \"Code To Use\", you can directly use it as a starting point.";

    pub fn new() -> Self {
        Self {
            skip: SkipState::default(),
        }
    }
}

impl Default for Stage1Baseline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageController for Stage1Baseline {
    fn identifier(&self) -> StageIdentifier {
        StageIdentifier::Stage1
    }

    async fn evaluate_substage_completion(&self, ctx: &mut StageContext<'_>) -> (bool, String) {
        let Some(best) = ctx.search.get_best_node(ctx.llm, true, false).await else {
            return (false, "No best node found".to_string());
        };
        let metric_val = best
            .metric
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let cache_key = format!(
            "stage=1_substage|id={}|metric={}|goals={}",
            best.id, metric_val, ctx.goals
        );
        let prompt = format!(
            "Evaluate whether the current baseline sub-stage is complete.\n\n\
             Evidence:\n- Best node metric: {}\n- Best node is_buggy: {:?}\n\n\
             Requirements for completion:\n{}",
            metric_val, best.is_buggy, ctx.goals,
        );
        cached_completion_evaluation(ctx, cache_key, prompt).await
    }

    async fn evaluate_stage_completion(&self, ctx: &mut StageContext<'_>) -> (bool, String) {
        if !ctx.search.journal.good_nodes().is_empty() {
            (true, "Found working implementation".to_string())
        } else {
            (false, "Working implementation not found yet".to_string())
        }
    }

    async fn reset_skip_state(&mut self, ctx: &mut StageContext<'_>) {
        self.skip = SkipState::default();
        let good_nodes = ctx.search.journal.good_nodes().len();
        info!(
            "Stage 1 skip evaluation: total_nodes={} good_nodes={}",
            ctx.search.journal.len(),
            good_nodes
        );
        if good_nodes > 0 {
            self.skip = SkipState {
                can_be_skipped: true,
                reason: "Stage 1 has at least one working implementation.".to_string(),
            };
        } else {
            self.skip.reason =
                "Produce a working baseline implementation before skipping.".to_string();
        }
    }

    fn skip_state(&self) -> (bool, String) {
        (self.skip.can_be_skipped, self.skip.reason.clone())
    }
}

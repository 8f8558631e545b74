//! Stage 2: hyperparameter tuning of the baseline.

use super::{cached_completion_evaluation, SkipState, StageContext, StageController};
use tracing::info;
use treeline_core::StageIdentifier;

pub struct Stage2Tuning {
    skip: SkipState,
}

impl Stage2Tuning {
    pub const DEFAULT_GOALS: &'static str =
        "- Change hyperparameters such as learning rate, number of epochs, batch size, etc. to improve the performance\n\
         - DO NOT change the model architecture from the previous stage\n\
         - Introduce additional datasets to test robustness.\n\
         - Research appropriate dataset sources (HuggingFace, Github, academic repositories, etc.) or use datasets specified in the research idea.";

    pub fn new() -> Self {
        Self {
            skip: SkipState::default(),
        }
    }
}

impl Default for Stage2Tuning {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageController for Stage2Tuning {
    fn identifier(&self) -> StageIdentifier {
        StageIdentifier::Stage2
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
            "stage=2_substage|id={}|metric={}|goals={}",
            best.id, metric_val, ctx.goals
        );
        let prompt = format!(
            "Evaluate if Stage 2 (baseline tuning) sub-stage is complete.\n\n\
             Evidence:\n- Datasets tested: {:?}\n- Best metric: {}\n\n\
             Requirements for completion:\n{}",
            best.datasets_successfully_tested, metric_val, ctx.goals,
        );
        cached_completion_evaluation(ctx, cache_key, prompt).await
    }

    async fn evaluate_stage_completion(&self, ctx: &mut StageContext<'_>) -> (bool, String) {
        let Some(best) = ctx.search.get_best_node(ctx.llm, true, false).await else {
            return (false, "No best node found".to_string());
        };
        let is_base = ctx
            .search
            .journal
            .nodes
            .first()
            .map(|first| first.id == best.id)
            .unwrap_or(false);
        if is_base {
            return (false, "No improvement from base node".to_string());
        }
        let metric_val = best
            .metric
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let cache_key = format!(
            "stage=2_stage|id={}|metric={}|goals=stable_convergence;two_datasets;no_training_instabilities",
            best.id, metric_val
        );
        let prompt = format!(
            "Evaluate if Stage 2 (baseline tuning) is complete based on the following \
             evidence:\n\n1. Datasets Tested: {:?}\n\n\
             Requirements for completion:\n\
             1. Training dynamics (metrics/loss curves) should show stable convergence\n\
             2. Results should be tested on at least two datasets\n\
             3. There should be no clear signs of training instabilities or divergence in the \
             reported metrics\n\nProvide a detailed evaluation of completion status.",
            best.datasets_successfully_tested,
        );
        cached_completion_evaluation(ctx, cache_key, prompt).await
    }

    async fn reset_skip_state(&mut self, ctx: &mut StageContext<'_>) {
        self.skip = SkipState::default();
        let best = ctx.search.get_best_node(ctx.llm, true, false).await;
        info!(
            "Stage 2 skip evaluation: total_nodes={} best_node={:?}",
            ctx.search.journal.len(),
            best.as_ref().map(|n| n.id.chars().take(8).collect::<String>()),
        );
        match best {
            Some(_) => {
                self.skip = SkipState {
                    can_be_skipped: true,
                    reason: "Stage 2 has a working node.".to_string(),
                };
            }
            None => {
                self.skip.reason = "Stage 2 skipping requires a best node.".to_string();
            }
        }
    }

    fn skip_state(&self) -> (bool, String) {
        (self.skip.can_be_skipped, self.skip.reason.clone())
    }
}

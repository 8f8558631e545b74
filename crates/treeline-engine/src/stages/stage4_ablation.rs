//! Stage 4: ablation studies. Loops until the iteration budget is spent.

use super::{cached_completion_evaluation, SkipState, StageContext, StageController};
use tracing::info;
use treeline_core::StageIdentifier;

pub struct Stage4Ablation {
    skip: SkipState,
}

impl Stage4Ablation {
    pub const DEFAULT_GOALS: &'static str =
        "- Systematically remove or replace individual components of the best implementation\n\
         - Quantify each component's contribution to the results\n\
         - Produce comparison plots for every ablation as .png files\n\
         - Keep everything else fixed so differences are attributable to the ablated component";

    pub fn new() -> Self {
        Self {
            skip: SkipState::default(),
        }
    }
}

impl Default for Stage4Ablation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageController for Stage4Ablation {
    fn identifier(&self) -> StageIdentifier {
        StageIdentifier::Stage4
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
            "stage=4_substage|id={}|metric={}|goals={}",
            best.id, metric_val, ctx.goals
        );
        let prompt = format!(
            "Evaluate if the current ablation sub-stage is complete.\n\n\
             Requirements for completion:\n{}",
            ctx.goals,
        );
        cached_completion_evaluation(ctx, cache_key, prompt).await
    }

    async fn evaluate_stage_completion(&self, _ctx: &mut StageContext<'_>) -> (bool, String) {
        // Ablations continue until max iterations.
        (false, "stage not completed".to_string())
    }

    async fn reset_skip_state(&mut self, ctx: &mut StageContext<'_>) {
        self.skip = SkipState::default();
        let best = ctx.search.get_best_node(ctx.llm, true, false).await;
        info!(
            "Stage 4 skip evaluation: total_nodes={} best_node={:?}",
            ctx.search.journal.len(),
            best.as_ref().map(|n| n.id.chars().take(8).collect::<String>()),
        );
        match best {
            Some(best) if best.is_buggy != Some(true) => {
                self.skip = SkipState {
                    can_be_skipped: true,
                    reason: "Stage 4 has a non-buggy best node.".to_string(),
                };
            }
            _ => {
                self.skip.reason = "Stage 4 skipping requires a non-buggy best node.".to_string();
            }
        }
    }

    fn skip_state(&self) -> (bool, String) {
        (self.skip.can_be_skipped, self.skip.reason.clone())
    }
}

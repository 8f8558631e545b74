//! Stage 3: creative research with plot generation.
//!
//! The stage never completes through its own predicate; it either exhausts
//! its iteration budget or is skipped. Past half the budget, a best node
//! that finishes suspiciously fast receives scale-up feedback.

use super::{cached_completion_evaluation, SkipState, StageContext, StageController};
use tracing::info;
use treeline_core::StageIdentifier;

pub struct Stage3Plotting {
    skip: SkipState,
}

impl Stage3Plotting {
    pub const DEFAULT_GOALS: &'static str =
        "- Explore creative extensions of the tuned baseline that test the hypothesis\n\
         - Produce publication-quality plots of every key result as .png files\n\
         - Store the raw results so metrics can be recomputed\n\
         - Prefer experiments that expose where the hypothesis holds and where it breaks";

    pub fn new() -> Self {
        Self {
            skip: SkipState::default(),
        }
    }
}

impl Default for Stage3Plotting {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageController for Stage3Plotting {
    fn identifier(&self) -> StageIdentifier {
        StageIdentifier::Stage3
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
            "stage=3_substage|id={}|metric={}|goals={}",
            best.id, metric_val, ctx.goals
        );
        let plot_summary = if best.plot_analyses.is_empty() {
            "No plot analyses available yet.".to_string()
        } else {
            best.plot_analyses
                .iter()
                .filter_map(|a| a.get("analysis").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "Evaluate if the current creative-research sub-stage is complete.\n\n\
             Evidence from the best node's plot analyses:\n{}\n\n\
             VLM feedback summary: {}\n\n\
             Requirements for completion:\n{}",
            plot_summary,
            best.vlm_feedback_summary.join(" "),
            ctx.goals,
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
        let exec_time_minutes = best.exec_time.unwrap_or(0.0) / 60.0;
        let timeout_minutes = ctx.cfg.exec.timeout_secs as f64 / 60.0;
        if ctx.search.journal.len() > ctx.max_iterations / 2
            && exec_time_minutes < timeout_minutes / 2.0
        {
            let feedback = format!(
                "Implementation works but runs too quickly ({:.2} minutes). Scale up the \
                 experiment by increasing epochs, using a larger model, or bigger datasets.",
                exec_time_minutes
            );
            if let Some(last) = ctx.search.journal.nodes.last_mut() {
                last.exec_time_feedback = feedback.clone();
            }
            return (false, feedback);
        }
        (false, "stage not completed".to_string())
    }

    async fn reset_skip_state(&mut self, ctx: &mut StageContext<'_>) {
        self.skip = SkipState::default();
        let best = ctx.search.get_best_node(ctx.llm, true, false).await;
        info!(
            "Stage 3 skip evaluation: total_nodes={} best_node={:?}",
            ctx.search.journal.len(),
            best.as_ref().map(|n| n.id.chars().take(8).collect::<String>()),
        );
        let Some(best) = best else {
            self.skip.reason = "Stage 3 skipping requires a best node.".to_string();
            return;
        };
        if best.is_buggy == Some(true) || best.is_buggy_plots == Some(true) {
            self.skip.reason = "Best node must pass execution and plot validation.".to_string();
            return;
        }
        if best.plots.is_empty() || best.plot_paths.is_empty() {
            self.skip.reason =
                "Generate at least one plot artifact before skipping Stage 3.".to_string();
            return;
        }
        self.skip = SkipState {
            can_be_skipped: true,
            reason: "Stage 3 has plot artifacts ready for downstream stages.".to_string(),
        };
    }

    fn skip_state(&self) -> (bool, String) {
        (self.skip.can_be_skipped, self.skip.reason.clone())
    }
}

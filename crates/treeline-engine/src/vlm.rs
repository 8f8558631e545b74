//! Vision-language feedback on generated plots (Stages 3 and 4).

use crate::types::NodeTask;
use crate::worker::WorkerDeps;
use std::path::PathBuf;
use tracing::{debug, warn};
use treeline_core::Node;
use treeline_llm::{
    structured_query_as, PlotFeedback, PlotSelectionResponse, ResponseSchema, VisionQueryRequest,
};

const MAX_PLOTS: usize = 10;

/// Populate plot feedback on a non-buggy node. Best-effort: failures leave
/// the node unchanged apart from a warning log.
pub async fn generate_vlm_feedback(task: &NodeTask, deps: &WorkerDeps, node: &mut Node) {
    let existing: Vec<PathBuf> = node
        .plot_paths
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.is_file())
        .collect();
    if existing.is_empty() {
        debug!("no plot files resolve for node {}; skipping VLM pass", node.id);
        return;
    }

    let selected = if existing.len() > MAX_PLOTS {
        select_plots(task, deps, &existing).await
    } else {
        existing
    };

    let message = format!(
        "You are reviewing experiment plots for the stage '{}'. Stage goals:\n{}\n\n\
         Assess whether the plots are meaningful and diagnostic, analyse what each plot shows, \
         and summarise the visual evidence.",
        task.stage_name(),
        task.stage_goals,
    );
    let request = VisionQueryRequest {
        message,
        system_message: None,
        image_paths: selected.clone(),
        model: task.cfg.agent.vlm_feedback.model.clone(),
        temperature: task.cfg.agent.vlm_feedback.temperature,
        schema_name: PlotFeedback::schema_name().to_string(),
        schema: PlotFeedback::json_schema(),
        max_images: MAX_PLOTS,
    };
    let (value, raw) = match deps.llm.vision_query(request).await {
        Ok(result) => result,
        Err(e) => {
            warn!("VLM feedback call failed for node {}: {}", node.id, e);
            return;
        }
    };
    let feedback: PlotFeedback = match serde_json::from_value(value.clone()) {
        Ok(feedback) => feedback,
        Err(e) => {
            warn!("VLM feedback did not match schema: {}", e);
            return;
        }
    };

    node.is_buggy_plots = Some(!feedback.valid_plots_received);
    node.plot_analyses = feedback
        .plot_analyses
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            serde_json::json!({
                "analysis": entry.analysis,
                "plot_path": selected.get(idx).map(|p| p.to_string_lossy().into_owned()),
            })
        })
        .collect();
    node.vlm_feedback_summary = vec![feedback.vlm_feedback_summary.clone()];
    node.vlm_feedback = Some(serde_json::json!({
        "structured": value,
        "raw": raw,
    }));

    write_harness_sidecar(node);
}

/// Ask the LLM to pick the most informative plots when there are too many.
async fn select_plots(task: &NodeTask, deps: &WorkerDeps, plots: &[PathBuf]) -> Vec<PathBuf> {
    let listing = plots
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "There are {} plot files from one experiment, more than the {} that can be reviewed. \
         Select the ones that best capture the results.\n\nAvailable plots:\n{}",
        plots.len(),
        MAX_PLOTS,
        listing,
    );
    let response: Result<PlotSelectionResponse, _> = structured_query_as(
        deps.llm.as_ref(),
        prompt,
        None,
        &task.cfg.agent.feedback.model,
        task.cfg.agent.feedback.temperature,
    )
    .await;
    match response {
        Ok(selection) => {
            let chosen: Vec<PathBuf> = selection
                .selected_plots
                .iter()
                .map(PathBuf::from)
                .filter(|p| plots.contains(p))
                .take(MAX_PLOTS)
                .collect();
            if chosen.is_empty() {
                plots.iter().take(MAX_PLOTS).cloned().collect()
            } else {
                chosen
            }
        }
        Err(e) => {
            warn!("plot selection failed ({}); using the first {}", e, MAX_PLOTS);
            plots.iter().take(MAX_PLOTS).cloned().collect()
        }
    }
}

/// Sidecar capturing the harness-derived feedback next to the raw Codex
/// result.
fn write_harness_sidecar(node: &Node) {
    let Some(dir) = &node.exp_results_dir else {
        return;
    };
    let sidecar = serde_json::json!({
        "is_buggy_plots": node.is_buggy_plots,
        "plot_analyses": node.plot_analyses,
        "vlm_feedback_summary": node.vlm_feedback_summary,
    });
    let path = std::path::Path::new(dir).join("node_result_harness.json");
    if let Err(e) = std::fs::write(
        &path,
        serde_json::to_string_pretty(&sidecar).unwrap_or_default(),
    ) {
        warn!("failed writing {}: {}", path.display(), e);
    }
}

//! Best-node selection and progress summaries over a journal.
//!
//! Selection is LLM-assisted but memoised aggressively: the caches are keyed
//! by a fingerprint of the candidate set, so repeated queries between state
//! changes never re-invoke the model. LLM failures always degrade to
//! metric-based selection; callers never see an error.

use std::collections::HashMap;
use tracing::{debug, info, warn};
use treeline_core::{
    BestNodeSelectedPayload, Journal, MetricValue, Node, TimelineEvent,
};
use treeline_llm::{structured_query_as, LlmClient, NodeSelectionResponse};
use treeline_telemetry::EventEmitter;

pub struct JournalSearch {
    pub journal: Journal,
    emitter: EventEmitter,
    node_selection_model: String,
    node_selection_temperature: f64,
    state_signature: Option<String>,
    best_cache: HashMap<String, Option<String>>,
    best_cache_candidate_ids: HashMap<String, Vec<String>>,
    best_cache_total_nodes: HashMap<String, usize>,
    summary_cache: HashMap<String, String>,
}

impl JournalSearch {
    pub fn new(
        journal: Journal,
        emitter: EventEmitter,
        node_selection_model: impl Into<String>,
        node_selection_temperature: f64,
    ) -> Self {
        Self {
            journal,
            emitter,
            node_selection_model: node_selection_model.into(),
            node_selection_temperature,
            state_signature: None,
            best_cache: HashMap::new(),
            best_cache_candidate_ids: HashMap::new(),
            best_cache_total_nodes: HashMap::new(),
            summary_cache: HashMap::new(),
        }
    }

    pub fn stage_name(&self) -> &str {
        &self.journal.stage_name
    }

    /// Append a node; step assignment happens inside the journal.
    pub fn append(&mut self, node: Node) -> String {
        self.journal.append(node).id.clone()
    }

    fn metric_key(metric: &Option<MetricValue>) -> String {
        metric
            .as_ref()
            .and_then(|m| m.value.as_ref())
            .map(|v| v.to_string())
            .unwrap_or_else(|| "None".to_string())
    }

    /// Fingerprint of every node state that affects selection; cache
    /// invalidation happens only when this changes.
    fn compute_state_signature(&self) -> String {
        let mut parts: Vec<String> = self
            .journal
            .nodes
            .iter()
            .map(|n| {
                format!(
                    "{}:{}:{:?}:{:?}:{}",
                    n.id,
                    Self::metric_key(&n.metric),
                    n.is_buggy,
                    n.is_buggy_plots,
                    n.is_seed_node as u8
                )
            })
            .collect();
        parts.sort();
        parts.join("|")
    }

    fn invalidate_if_state_changed(&mut self) {
        let current = self.compute_state_signature();
        match &self.state_signature {
            None => self.state_signature = Some(current),
            Some(previous) if *previous != current => {
                debug!("node state changed; invalidating best-node cache");
                self.best_cache.clear();
                self.best_cache_candidate_ids.clear();
                self.best_cache_total_nodes.clear();
                self.state_signature = Some(current);
            }
            _ => {}
        }
    }

    /// Candidate ids for selection: good (or all) nodes minus seed nodes,
    /// falling back to the seeded set when exclusion empties it.
    fn candidate_ids(&self, only_good: bool) -> Vec<String> {
        let pool: Vec<&Node> = if only_good {
            self.journal.good_nodes()
        } else {
            self.journal.nodes.iter().collect()
        };
        if pool.is_empty() {
            return Vec::new();
        }
        let non_seed: Vec<&Node> = pool.iter().copied().filter(|n| !n.is_seed_node).collect();
        let chosen = if non_seed.is_empty() { pool } else { non_seed };
        chosen.into_iter().map(|n| n.id.clone()).collect()
    }

    fn selection_signature(&self, candidate_ids: &[String], only_good: bool, val_only: bool) -> String {
        let mut parts = vec![
            format!("og={}", only_good),
            format!("val_only={}", val_only),
            format!("model={}", self.node_selection_model),
        ];
        let mut sorted = candidate_ids.to_vec();
        sorted.sort();
        for id in sorted {
            if let Some(n) = self.journal.node_by_id(&id) {
                parts.push(format!(
                    "{}:{}:{:?}:{:?}",
                    n.id,
                    Self::metric_key(&n.metric),
                    n.is_buggy,
                    n.is_buggy_plots
                ));
            }
        }
        parts.join("|")
    }

    /// Argmax by metric with first-in-insertion-order tie-breaking.
    fn best_by_metric(&self, candidate_ids: &[String]) -> Option<String> {
        let mut best: Option<&Node> = None;
        for node in &self.journal.nodes {
            if !candidate_ids.contains(&node.id) || node.metric.is_none() {
                continue;
            }
            match best {
                None => best = Some(node),
                Some(current) => {
                    let better = node
                        .metric
                        .as_ref()
                        .zip(current.metric.as_ref())
                        .map(|(a, b)| a.partial_cmp(b) == Some(std::cmp::Ordering::Greater))
                        .unwrap_or(false);
                    if better {
                        best = Some(node);
                    }
                }
            }
        }
        best.map(|n| n.id.clone())
    }

    fn cache_result(
        &mut self,
        signature: String,
        candidate_ids: Vec<String>,
        result: Option<String>,
    ) {
        self.best_cache_total_nodes
            .insert(signature.clone(), self.journal.len());
        self.best_cache_candidate_ids
            .insert(signature.clone(), candidate_ids);
        self.best_cache.insert(signature, result);
    }

    /// Record the reasoning on the selected node; emits best-node telemetry
    /// only for real selections (fallback paths stay silent).
    fn record_reasoning(&mut self, node_id: &str, reasoning: &str, emit: bool) {
        let reasoning = if reasoning.trim().is_empty() {
            "No reasoning provided."
        } else {
            reasoning
        };
        let stage = self.journal.stage_name.clone();
        let has_run_id = self.journal.run_id.is_some();
        let Some(node) = self.journal.node_by_id_mut(node_id) else {
            return;
        };
        node.best_node_reasoning = Some(reasoning.to_string());
        let step = node.step.unwrap_or(0);
        if emit && has_run_id {
            self.emitter.emit(&TimelineEvent::BestNodeSelected(
                BestNodeSelectedPayload {
                    stage,
                    node_id: step.to_string(),
                    reasoning: reasoning.to_string(),
                },
            ));
        }
    }

    /// Return the best node found so far (a snapshot).
    pub async fn get_best_node(
        &mut self,
        llm: &dyn LlmClient,
        only_good: bool,
        use_val_metric_only: bool,
    ) -> Option<Node> {
        self.invalidate_if_state_changed();

        if only_good && self.journal.good_nodes().is_empty() {
            info!(
                "skipping best-node selection: only_good=true but there are no good candidates"
            );
            return None;
        }

        let candidate_ids = self.candidate_ids(only_good);
        if candidate_ids.is_empty() {
            return None;
        }
        let signature = self.selection_signature(&candidate_ids, only_good, use_val_metric_only);
        if let Some(cached) = self.best_cache.get(&signature) {
            debug!("best-node selection signature unchanged; returning cached result");
            return cached
                .as_ref()
                .and_then(|id| self.journal.node_by_id(id))
                .cloned();
        }

        if use_val_metric_only {
            let selected = self.best_by_metric(&candidate_ids);
            if let Some(id) = &selected {
                let metric = self
                    .journal
                    .node_by_id(id)
                    .and_then(|n| n.metric.clone())
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                self.record_reasoning(
                    id,
                    &format!(
                        "Metric-only selection (use_val_metric_only=true). Metric value: {}",
                        metric
                    ),
                    true,
                );
            }
            self.cache_result(signature, candidate_ids, selected.clone());
            return selected
                .and_then(|id| self.journal.node_by_id(&id))
                .cloned();
        }

        if candidate_ids.len() == 1 {
            let id = candidate_ids[0].clone();
            self.record_reasoning(&id, "Only one candidate available; bypassed LLM selection.", true);
            self.cache_result(signature, candidate_ids, Some(id.clone()));
            return self.journal.node_by_id(&id).cloned();
        }

        let prompt = self.build_selection_prompt(&candidate_ids);
        let selection: Result<NodeSelectionResponse, _> = structured_query_as(
            llm,
            prompt,
            None,
            &self.node_selection_model,
            self.node_selection_temperature,
        )
        .await;

        let selected = match selection {
            Ok(response) => {
                if candidate_ids.contains(&response.selected_id) {
                    let short: String = response.selected_id.chars().take(8).collect();
                    self.emitter.emit(&TimelineEvent::run_log(
                        format!("Selected best implementation: {}...", short),
                        "info",
                    ));
                    let preview: String = response.reasoning.chars().take(500).collect();
                    if !preview.trim().is_empty() {
                        self.emitter.emit(&TimelineEvent::run_log(
                            format!("Reasoning: {}", preview),
                            "info",
                        ));
                    }
                    self.record_reasoning(&response.selected_id, &response.reasoning, true);
                    Some(response.selected_id)
                } else {
                    warn!(
                        "LLM returned unknown selected_id={}; falling back to metric-based selection",
                        response.selected_id
                    );
                    let fallback = self.best_by_metric(&candidate_ids);
                    if let Some(id) = &fallback {
                        self.record_reasoning(
                            id,
                            &format!(
                                "LLM selected unknown node id {}; stored best metric candidate instead.",
                                response.selected_id
                            ),
                            false,
                        );
                    }
                    fallback
                }
            }
            Err(e) => {
                warn!("error in LLM best-node selection; falling back to metric-based selection ({})", e);
                let fallback = self.best_by_metric(&candidate_ids);
                if let Some(id) = &fallback {
                    self.record_reasoning(
                        id,
                        &format!("LLM selection error: {}. Falling back to best metric.", e),
                        false,
                    );
                }
                fallback
            }
        };

        self.cache_result(signature, candidate_ids, selected.clone());
        selected.and_then(|id| self.journal.node_by_id(&id)).cloned()
    }

    fn build_selection_prompt(&self, candidate_ids: &[String]) -> String {
        let mut prompt = String::from(
            "You are an experienced AI researcher evaluating different implementations of an \
             experiment to select the best one. You should consider all aspects including \
             performance metrics, training dynamics, and generated plots quality.\n\n\
             Select the best implementation from the candidates below, considering all available \
             evidence. Avoid relying too heavily on the validation loss alone, because it may \
             not be directly comparable across different objective functions or training \
             details. If there are multiple validation losses (e.g., when evaluating multiple \
             datasets), consider all of them and select the implementation that performs best \
             overall.\n\nCandidates:\n",
        );
        for id in candidate_ids {
            let Some(node) = self.journal.node_by_id(id) else {
                continue;
            };
            prompt.push_str(&format!("ID: {}\n", node.id));
            if let Some(metric) = &node.metric {
                prompt.push_str(&format!("Metric: {}\n", metric));
            } else if let Some(analysis) = &node.analysis {
                prompt.push_str(&format!("Training Analysis: {}\n", analysis));
            } else if !node.vlm_feedback_summary.is_empty() {
                prompt.push_str(&format!(
                    "VLM Feedback: {}\n",
                    node.vlm_feedback_summary.join(" ")
                ));
            } else {
                prompt.push_str("N/A\n");
            }
        }
        prompt
    }

    /// Best good node by metric alone; the synchronous helper used where an
    /// LLM round-trip is not warranted.
    pub fn best_good_node_by_metric(&self) -> Option<&Node> {
        let candidate_ids = self.candidate_ids(true);
        let id = self.best_by_metric(&candidate_ids)?;
        self.journal.node_by_id(&id)
    }

    /// Deterministic progress summary, cached by the good/buggy id sets.
    pub fn generate_summary(&mut self, include_code: bool) -> String {
        if self.journal.is_empty() {
            return "No experiments conducted yet.".to_string();
        }

        let mut good_ids: Vec<String> =
            self.journal.good_nodes().iter().map(|n| n.id.clone()).collect();
        good_ids.sort();
        let mut buggy_ids: Vec<String> =
            self.journal.buggy_nodes().iter().map(|n| n.id.clone()).collect();
        buggy_ids.sort();
        let cache_key = format!(
            "include_code={}|good_ids={}|buggy_ids={}",
            include_code,
            good_ids.join(","),
            buggy_ids.join(",")
        );
        if let Some(cached) = self.summary_cache.get(&cache_key) {
            debug!("summary cache hit (good and buggy sets unchanged)");
            return cached.clone();
        }

        let best = self.best_good_node_by_metric();
        let best_id = best
            .map(|n| n.id.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "N/A".to_string());
        let best_metric = best
            .and_then(|n| n.metric.as_ref())
            .map(|m| m.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        let mut lines = vec![
            format!("Stage: {}", self.journal.stage_name),
            format!("Total nodes: {}", self.journal.len()),
            format!("Good nodes: {}", self.journal.good_nodes().len()),
            format!("Buggy nodes: {}", self.journal.buggy_nodes().len()),
            format!("Best node: {} (metric: {})", best_id, best_metric),
        ];

        let mut recent_good: Vec<&Node> = self.journal.good_nodes();
        recent_good.sort_by(|a, b| b.ctime.partial_cmp(&a.ctime).unwrap_or(std::cmp::Ordering::Equal));
        if !recent_good.is_empty() {
            lines.push("Recent successful experiments:".to_string());
            for n in recent_good.iter().take(3) {
                let metric_str = n
                    .metric
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                let plan_preview = preview(&n.plan, 160);
                lines.push(format!(
                    "- {} metric={} plan={}",
                    &n.id.chars().take(8).collect::<String>(),
                    metric_str,
                    plan_preview
                ));
                if include_code && !n.code.is_empty() {
                    lines.push(format!("  code_chars={}", n.code.len()));
                }
            }
        }

        let mut recent_bad: Vec<&Node> = self.journal.buggy_nodes();
        recent_bad.sort_by(|a, b| b.ctime.partial_cmp(&a.ctime).unwrap_or(std::cmp::Ordering::Equal));
        if !recent_bad.is_empty() {
            lines.push("Recent failures:".to_string());
            for n in recent_bad.iter().take(3) {
                let exc = n.exc_type.as_deref().unwrap_or("Unknown");
                let analysis_preview = preview(n.analysis.as_deref().unwrap_or(""), 160);
                lines.push(format!(
                    "- {} exc_type={} analysis={}",
                    &n.id.chars().take(8).collect::<String>(),
                    exc,
                    analysis_preview
                ));
                if let Some(feedback) = &n.user_feedback_payload {
                    lines.push(format!("  user_feedback={}", preview(feedback, 160)));
                }
            }
        }

        let summary = lines.join("\n").trim().to_string();
        self.summary_cache.insert(cache_key, summary.clone());
        summary
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.trim()
        .replace('\n', " ")
        .chars()
        .take(max_chars)
        .collect()
}

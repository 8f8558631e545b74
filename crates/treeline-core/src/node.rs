//! A single node in the solution tree: plan + code + execution result +
//! evaluation. Nodes form an arena: `parent` is an id back-reference and
//! children are recomputed from the owning journal.

use crate::error::Result;
use crate::metric::MetricValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    // ---- identity ----
    pub id: String,
    /// Index at which the node was appended to its journal.
    pub step: Option<usize>,
    pub ctime: f64,
    /// Parent node id. Children are derived from the arena.
    pub parent: Option<String>,

    // ---- code & plan ----
    pub plan: String,
    pub code: String,
    pub plot_code: Option<String>,

    // ---- execution info ----
    pub term_out: Vec<String>,
    pub exec_time: Option<f64>,
    pub exc_type: Option<String>,
    pub exc_info: Option<Value>,

    // ---- metrics pass ----
    pub parse_metrics_code: String,

    // ---- evaluation ----
    pub analysis: Option<String>,
    pub metric: Option<MetricValue>,
    pub is_buggy: Option<bool>,
    pub is_buggy_plots: Option<bool>,
    pub best_node_reasoning: Option<String>,
    pub vlm_feedback: Option<Value>,
    pub plot_analyses: Vec<Value>,
    pub vlm_feedback_summary: Vec<String>,
    pub datasets_successfully_tested: Vec<String>,
    pub exec_time_feedback: String,

    // ---- specialisations ----
    pub is_seed_node: bool,
    pub is_seed_agg_node: bool,
    pub ablation_name: Option<String>,
    pub hyperparam_name: Option<String>,

    // ---- feedback channel ----
    pub is_user_feedback: bool,
    pub user_feedback_payload: Option<String>,
    pub user_feedback_pending: bool,

    // ---- artifacts ----
    pub exp_results_dir: Option<String>,
    /// Relative plot paths for display.
    pub plots: Vec<String>,
    /// Absolute plot paths for programmatic access.
    pub plot_paths: Vec<String>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            step: None,
            ctime: now_epoch(),
            parent: None,
            plan: String::new(),
            code: String::new(),
            plot_code: None,
            term_out: Vec::new(),
            exec_time: None,
            exc_type: None,
            exc_info: None,
            parse_metrics_code: String::new(),
            analysis: None,
            metric: None,
            is_buggy: None,
            is_buggy_plots: None,
            best_node_reasoning: None,
            vlm_feedback: None,
            plot_analyses: Vec::new(),
            vlm_feedback_summary: Vec::new(),
            datasets_successfully_tested: Vec::new(),
            exec_time_feedback: String::new(),
            is_seed_node: false,
            is_seed_agg_node: false,
            ablation_name: None,
            hyperparam_name: None,
            is_user_feedback: false,
            user_feedback_payload: None,
            user_feedback_pending: false,
            exp_results_dir: None,
            plots: Vec::new(),
            plot_paths: Vec::new(),
        }
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Node {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// A node with a recorded exception type is always buggy.
    pub fn buggy(&self) -> bool {
        self.exc_type.is_some() || self.is_buggy == Some(true)
    }

    /// A "good" node passed both execution and plot validation.
    pub fn good(&self) -> bool {
        self.is_buggy == Some(false) && self.is_buggy_plots == Some(false)
    }

    pub fn absorb_exec_result(
        &mut self,
        term_out: Vec<String>,
        exec_time: f64,
        exc_type: Option<String>,
        exc_info: Option<Value>,
    ) {
        self.term_out = term_out;
        self.exec_time = Some(exec_time);
        self.exc_type = exc_type;
        self.exc_info = exc_info;
    }

    /// Joined, trimmed terminal output for prompts.
    pub fn term_out_text(&self, max_chars: usize) -> String {
        let joined = self.term_out.concat();
        trim_long_string(&joined, max_chars)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild a node from a serialized snapshot. Unknown keys are ignored;
    /// legacy bare-number metrics are wrapped into the structured shape.
    pub fn from_value(value: Value) -> Result<Node> {
        let mut value = value;
        if let Some(obj) = value.as_object_mut() {
            // Serialized trees carry `parent_id`/`children` relationship keys.
            if let Some(parent_id) = obj.remove("parent_id") {
                if obj.get("parent").map(Value::is_null).unwrap_or(true) {
                    obj.insert("parent".to_string(), parent_id);
                }
            }
            obj.remove("children");
            enum MetricShape {
                Keep,
                Wrap,
                Drop,
            }
            let shape = match obj.get("metric") {
                Some(Value::Number(_)) => MetricShape::Wrap,
                Some(Value::Null) => MetricShape::Drop,
                Some(Value::Object(m)) if m.get("value").map(Value::is_null).unwrap_or(false) => {
                    MetricShape::Drop
                }
                _ => MetricShape::Keep,
            };
            match shape {
                MetricShape::Wrap => {
                    let num = obj.remove("metric").unwrap_or(Value::Null);
                    obj.insert("metric".to_string(), serde_json::json!({ "value": num }));
                }
                MetricShape::Drop => {
                    obj.remove("metric");
                }
                MetricShape::Keep => {}
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Keep the head and tail of a long string, eliding the middle.
pub fn trim_long_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars / 2;
    let head: String = s.chars().take(keep).collect();
    let tail: String = s
        .chars()
        .rev()
        .take(keep)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}\n... [output truncated] ...\n{}", head, tail)
}

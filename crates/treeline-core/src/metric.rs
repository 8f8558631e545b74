//! Metric values attached to nodes.
//!
//! A node without a metric always orders below every node with one. The
//! metrics pass stores a structured value of the form
//! `{"metric_names": [{"metric_name", "lower_is_better", "data": [...]}]}`;
//! plain numeric values are also accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricValue {
    pub value: Option<Value>,
    pub maximize: Option<bool>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl MetricValue {
    pub fn new(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    /// The "worst" metric: orders below every concrete value.
    pub fn worst() -> Self {
        Self::default()
    }

    pub fn is_worst(&self) -> bool {
        self.value.is_none()
    }

    /// Flatten the value into a single comparable score.
    ///
    /// Plain numbers compare directly (negated when `maximize == Some(false)`).
    /// The metrics-pass shape averages per-dataset `final_value`s, negating
    /// metrics marked `lower_is_better`.
    pub fn comparable_score(&self) -> Option<f64> {
        let value = self.value.as_ref()?;
        if let Some(num) = value.as_f64() {
            return Some(if self.maximize == Some(false) { -num } else { num });
        }
        let metrics = value.get("metric_names")?.as_array()?;
        let mut total = 0.0;
        let mut count = 0usize;
        for metric in metrics {
            let lower_is_better = metric
                .get("lower_is_better")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let Some(data) = metric.get("data").and_then(Value::as_array) else {
                continue;
            };
            for point in data {
                if let Some(v) = point.get("final_value").and_then(Value::as_f64) {
                    total += if lower_is_better { -v } else { v };
                    count += 1;
                }
            }
        }
        if count == 0 {
            None
        } else {
            Some(total / count as f64)
        }
    }
}

impl PartialOrd for MetricValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self.comparable_score(), other.comparable_score()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            (Some(_), None) => Some(std::cmp::Ordering::Greater),
            (None, Some(_)) => Some(std::cmp::Ordering::Less),
            (None, None) => Some(std::cmp::Ordering::Equal),
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            None => write!(f, "worst"),
            Some(value) => {
                if let Some(name) = &self.name {
                    write!(f, "{}=", name)?;
                }
                if let Some(num) = value.as_f64() {
                    write!(f, "{:.6}", num)
                } else if let Some(score) = self.comparable_score() {
                    write!(f, "{:.6} (aggregated)", score)
                } else {
                    write!(f, "{}", value)
                }
            }
        }
    }
}

//! HTTP publisher forwarding telemetry events to the control plane.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use treeline_core::EventKind;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1200);

/// Single codex event for bulk insertion (matches the receiver schema).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodexEventItem {
    pub stage: String,
    pub node: usize,
    pub event_type: String,
    pub event_content: Value,
    pub occurred_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Status(u16),
}

impl PostError {
    /// Transport failures, 429 and 5xx retry; any other 4xx is fatal.
    pub fn is_retriable(&self) -> bool {
        match self {
            PostError::Transport(_) => true,
            PostError::Status(code) => *code == 429 || *code >= 500,
        }
    }
}

/// One POST. Factored behind a trait so the drain worker and retry policy
/// are testable without a live receiver.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, token: &str, body: &Value) -> Result<(), PostError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, url: &str, token: &str, body: &Value) -> Result<(), PostError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| PostError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PostError::Status(status.as_u16()))
        }
    }
}

#[derive(Clone)]
pub struct WebhookClient {
    base_url: String,
    token: String,
    run_id: String,
    transport: Arc<dyn Transport>,
}

impl WebhookClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::with_transport(base_url, token, run_id, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(
        base_url: impl Into<String>,
        token: impl Into<String>,
        run_id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            token: token.into(),
            run_id: run_id.into(),
            transport,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn endpoint_for(kind: EventKind) -> Option<&'static str> {
        match kind {
            EventKind::RunStageProgress => Some("/stage-progress"),
            EventKind::RunLog => Some("/run-log"),
            EventKind::SubstageCompleted => Some("/substage-completed"),
            EventKind::StageSummary | EventKind::SubstageSummary => Some("/substage-summary"),
            EventKind::PaperGenerationProgress => Some("/paper-generation-progress"),
            EventKind::TreeVizStored => Some("/tree-viz-stored"),
            EventKind::RunningCode => Some("/running-code"),
            EventKind::RunCompleted => Some("/run-completed"),
            EventKind::StageSkipWindow => Some("/stage-skip-window"),
            EventKind::ArtifactUploaded => Some("/artifact-uploaded"),
            EventKind::ReviewCompleted => Some("/review-completed"),
            EventKind::CodexEvent => Some("/codex-event"),
            EventKind::TokenUsage => Some("/token-usage"),
            EventKind::FigureReviews => Some("/figure-reviews"),
            // Locally-logged kinds without a dedicated receiver endpoint.
            EventKind::StageCompleted | EventKind::BestNodeSelected => None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, self.run_id, path)
    }

    /// Fire-and-forget POST with retry; the returned handle resolves to
    /// whether the publish ultimately succeeded.
    fn post(&self, path: &str, payload: Value) -> JoinHandle<bool> {
        let url = self.url(path);
        let token = self.token.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            match post_with_retry(transport.as_ref(), &url, &token, &payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to publish telemetry webhook after retries: url={} ({})", url, e);
                    false
                }
            }
        })
    }

    /// Publish one event kind as `{"event": payload}`. Kinds without a
    /// receiver endpoint are dropped.
    pub fn publish(&self, kind: EventKind, payload: Value) -> Option<JoinHandle<bool>> {
        let endpoint = Self::endpoint_for(kind)?;
        debug!("publishing kind={:?} to {}", kind, endpoint);
        Some(self.post(endpoint, serde_json::json!({ "event": payload })))
    }

    pub fn publish_run_started(&self) -> JoinHandle<bool> {
        self.post("/run-started", serde_json::json!({}))
    }

    pub fn publish_initialization_progress(&self, message: &str) -> JoinHandle<bool> {
        self.post(
            "/initialization-progress",
            serde_json::json!({ "message": message }),
        )
    }

    pub fn publish_run_finished(&self, success: bool, message: Option<&str>) -> JoinHandle<bool> {
        let mut payload = serde_json::json!({ "success": success });
        if let Some(message) = message {
            payload["message"] = Value::String(message.to_string());
        }
        self.post("/run-finished", payload)
    }

    pub fn publish_heartbeat(&self) -> JoinHandle<bool> {
        self.post("/heartbeat", serde_json::json!({}))
    }

    pub fn publish_hw_stats(&self, partitions: Vec<Value>) -> Option<JoinHandle<bool>> {
        if partitions.is_empty() {
            return None;
        }
        Some(self.post(
            "/hw-stats",
            serde_json::json!({ "partitions": partitions }),
        ))
    }

    pub fn publish_gpu_shortage(
        &self,
        required_gpus: usize,
        available_gpus: usize,
        message: Option<&str>,
    ) -> JoinHandle<bool> {
        let mut payload = serde_json::json!({
            "required_gpus": required_gpus,
            "available_gpus": available_gpus,
        });
        if let Some(message) = message {
            payload["message"] = Value::String(message.to_string());
        }
        self.post("/gpu-shortage", payload)
    }

    /// Publish multiple codex events in a single request.
    pub fn publish_codex_events_bulk(&self, events: Vec<CodexEventItem>) -> Option<JoinHandle<bool>> {
        if events.is_empty() {
            return None;
        }
        let payload = serde_json::json!({ "events": events });
        Some(self.post("/codex-events-bulk", payload))
    }
}

/// Exponential-backoff retry: up to 5 attempts, 1 s initial, 10 s cap.
pub async fn post_with_retry(
    transport: &dyn Transport,
    url: &str,
    token: &str,
    body: &Value,
) -> Result<(), PostError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = PostError::Transport("no attempts made".to_string());
    for attempt in 1..=MAX_ATTEMPTS {
        match transport.post(url, token, body).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retriable() && attempt < MAX_ATTEMPTS => {
                debug!("webhook POST attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

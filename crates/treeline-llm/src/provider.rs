//! LLM client trait: schema-validated structured query + image-aware query.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Response schemas the client must force the model to produce.
///
/// Schemas are hand-written JSON Schema values; the typed struct mirrors them
/// for deserialization.
pub trait ResponseSchema: DeserializeOwned {
    fn schema_name() -> &'static str;
    fn json_schema() -> Value;
}

#[derive(Clone, Debug)]
pub struct StructuredQueryRequest {
    pub system_message: String,
    pub user_message: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub schema_name: String,
    pub schema: Value,
}

#[derive(Clone, Debug)]
pub struct VisionQueryRequest {
    pub message: String,
    pub system_message: Option<String>,
    pub image_paths: Vec<PathBuf>,
    pub model: String,
    pub temperature: f64,
    pub schema_name: String,
    pub schema: Value,
    pub max_images: usize,
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a JSON value matching the request's schema, or an error.
    async fn structured_query(&self, request: StructuredQueryRequest) -> LlmResult<Value>;

    /// Structured query with inline images; returns `(value, raw_text)`.
    async fn vision_query(&self, request: VisionQueryRequest) -> LlmResult<(Value, String)>;
}

/// Typed wrapper over [`LlmClient::structured_query`].
pub async fn structured_query_as<T: ResponseSchema>(
    client: &dyn LlmClient,
    system_message: impl Into<String>,
    user_message: Option<String>,
    model: &str,
    temperature: f64,
) -> LlmResult<T> {
    let value = client
        .structured_query(StructuredQueryRequest {
            system_message: system_message.into(),
            user_message,
            model: model.to_string(),
            temperature,
            schema_name: T::schema_name().to_string(),
            schema: T::json_schema(),
        })
        .await?;
    serde_json::from_value(value).map_err(|e| {
        LlmError::InvalidResponse(format!("{} did not match schema: {}", T::schema_name(), e))
    })
}

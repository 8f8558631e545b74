//! Anthropic Claude API client producing schema-validated structured output.
//!
//! Structured responses are obtained by declaring a single tool whose
//! `input_schema` is the requested schema and forcing the model to call it;
//! the tool input is the validated JSON payload.

use crate::provider::{
    LlmClient, LlmError, LlmResult, StructuredQueryRequest, VisionQueryRequest,
};
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1200);

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn send(&self, body: &AnthropicRequest) -> LlmResult<AnthropicResponse> {
        debug!("Anthropic request: model={}", body.model);
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited {
                    retry_after_ms: 60000,
                },
                _ => LlmError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        Ok(response.json::<AnthropicResponse>().await?)
    }
}

fn extract_tool_input(response: &AnthropicResponse, tool_name: &str) -> LlmResult<Value> {
    for block in &response.content {
        if let ContentBlock::ToolUse { name, input, .. } = block {
            if name == tool_name {
                return Ok(input.clone());
            }
        }
    }
    Err(LlmError::InvalidResponse(format!(
        "no tool_use block for {} in response",
        tool_name
    )))
}

fn response_text(response: &AnthropicResponse) -> String {
    response
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn schema_tool(name: &str, schema: Value) -> AnthropicTool {
    AnthropicTool {
        name: name.to_string(),
        description: "Record the structured response.".to_string(),
        input_schema: schema,
    }
}

fn image_media_type(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn structured_query(&self, request: StructuredQueryRequest) -> LlmResult<Value> {
        let user_text = request
            .user_message
            .clone()
            .unwrap_or_else(|| "Respond using the provided tool.".to_string());
        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: 8192,
            temperature: Some(request.temperature),
            system: Some(request.system_message.clone()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: Value::String(user_text),
            }],
            tools: Some(vec![schema_tool(&request.schema_name, request.schema.clone())]),
            tool_choice: Some(serde_json::json!({"type": "tool", "name": request.schema_name})),
        };
        let response = self.send(&body).await?;
        extract_tool_input(&response, &request.schema_name)
    }

    async fn vision_query(&self, request: VisionQueryRequest) -> LlmResult<(Value, String)> {
        let mut blocks: Vec<Value> = Vec::new();
        for path in request.image_paths.iter().take(request.max_images) {
            let bytes = std::fs::read(path)
                .map_err(|e| LlmError::Image(format!("{}: {}", path.display(), e)))?;
            blocks.push(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image_media_type(path),
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }
        blocks.push(serde_json::json!({"type": "text", "text": request.message}));

        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: 8192,
            temperature: Some(request.temperature),
            system: request.system_message.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: Value::Array(blocks),
            }],
            tools: Some(vec![schema_tool(&request.schema_name, request.schema.clone())]),
            tool_choice: Some(serde_json::json!({"type": "tool", "name": request.schema_name})),
        };
        let response = self.send(&body).await?;
        let value = extract_tool_input(&response, &request.schema_name)?;
        let raw = response_text(&response);
        Ok((value, raw))
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[allow(dead_code)]
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

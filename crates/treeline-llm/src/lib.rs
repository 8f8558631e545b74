//! Treeline LLM - schema-validated structured queries and VLM feedback

pub mod anthropic;
pub mod provider;
pub mod schemas;

pub use anthropic::AnthropicClient;
pub use provider::{
    structured_query_as, LlmClient, LlmError, LlmResult, ResponseSchema,
    StructuredQueryRequest, VisionQueryRequest,
};
pub use schemas::*;

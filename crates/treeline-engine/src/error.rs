//! Engine error taxonomy.
//!
//! Per-node failures degrade to buggy-node outcomes; only GPU shortage and
//! configuration contract breaches abort the run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The execution was intentionally terminated (skip or user feedback).
    /// Swallowed by the parallel agent; the node is deferred.
    #[error("execution {execution_id} terminated intentionally")]
    ExecutionTerminated {
        execution_id: String,
        exec_time: f64,
    },

    /// The worker died on a subprocess or IO failure; the node is marked
    /// buggy and iteration continues.
    #[error("execution {execution_id} crashed unexpectedly: {message}")]
    ExecutionCrashed {
        execution_id: String,
        message: String,
    },

    #[error("detected {available} GPU(s) but configuration requires at least {required}")]
    GpuShortage { required: usize, available: usize },

    #[error(transparent)]
    Core(#[from] treeline_core::Error),

    #[error("llm error: {0}")]
    Llm(#[from] treeline_llm::LlmError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

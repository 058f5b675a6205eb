//! Generation capability traits

use crate::types::{Classification, GenerateRequest, Generation, GenerationParams};
use std::path::Path;
use std::sync::Arc;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// LLM error types
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

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("load failed: {0}")]
    LoadFailed(String),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Failures worth one retry: timeouts, rate limits, and connection trouble.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::RateLimited { .. } => true,
            LlmError::NetworkError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Hosted generation API
#[async_trait::async_trait]
pub trait RemoteProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation>;
}

/// Loads local model artifacts into memory.
#[async_trait::async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn load(
        &self,
        artifact: &Path,
        params: &GenerationParams,
    ) -> LlmResult<Arc<dyn LoadedModel>>;
}

/// A resident local model.
#[async_trait::async_trait]
pub trait LoadedModel: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation>;

    /// Release the model's memory. Called once, when the slot evicts it.
    async fn unload(&self) {}
}

/// External content-safety classifier
#[async_trait::async_trait]
pub trait ModerationClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> LlmResult<Classification>;
}

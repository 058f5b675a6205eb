//! Error types for Chatrelay

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown persona: {0}")]
    UnknownPersona(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("content rejected: {reason}")]
    ContentRejected {
        categories: Vec<String>,
        reason: String,
    },

    #[error("no backend available for persona {persona}")]
    NoBackendAvailable { persona: String },

    #[error("slot {slot} busy: {occupant} is still in use")]
    SlotBusy { slot: usize, occupant: String },

    #[error("failed to load {backend}: {message}")]
    LoadFailure { backend: String, message: String },

    #[error("{backend} needs {cost} units but slot {slot} has a budget of {budget}")]
    InsufficientBudget {
        backend: String,
        cost: u32,
        budget: u32,
        slot: usize,
    },

    #[error("generation failed on {backend}: {message}")]
    GenerationFailed { backend: String, message: String },

    #[error("backend tier unreachable: {0}")]
    BackendUnreachable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable, wire-visible classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownPersona,
    UnknownBackend,
    ContentRejected,
    NoBackendAvailable,
    SlotBusy,
    LoadFailure,
    InsufficientBudget,
    GenerationFailed,
    BackendUnreachable,
    SessionNotFound,
    InvalidRequest,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownPersona => "unknown_persona",
            Self::UnknownBackend => "unknown_backend",
            Self::ContentRejected => "content_rejected",
            Self::NoBackendAvailable => "no_backend_available",
            Self::SlotBusy => "slot_busy",
            Self::LoadFailure => "load_failure",
            Self::InsufficientBudget => "insufficient_budget",
            Self::GenerationFailed => "generation_failed",
            Self::BackendUnreachable => "backend_unreachable",
            Self::SessionNotFound => "session_not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    /// Errors caused by the request itself. Retrying the same request will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownPersona
                | Self::UnknownBackend
                | Self::ContentRejected
                | Self::SessionNotFound
                | Self::InvalidRequest
        )
    }

    /// Transient server-side conditions worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SlotBusy | Self::NoBackendAvailable | Self::BackendUnreachable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownPersona(_) => ErrorKind::UnknownPersona,
            Self::UnknownBackend(_) => ErrorKind::UnknownBackend,
            Self::ContentRejected { .. } => ErrorKind::ContentRejected,
            Self::NoBackendAvailable { .. } => ErrorKind::NoBackendAvailable,
            Self::SlotBusy { .. } => ErrorKind::SlotBusy,
            Self::LoadFailure { .. } => ErrorKind::LoadFailure,
            Self::InsufficientBudget { .. } => ErrorKind::InsufficientBudget,
            Self::GenerationFailed { .. } => ErrorKind::GenerationFailed,
            Self::BackendUnreachable(_) => ErrorKind::BackendUnreachable,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::IoError(_) | Self::JsonError(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn load_failure(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadFailure {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn generation_failed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GenerationFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

//! Error responses
//!
//! Every failure leaves the gateway as `{"error": {kind, reason, categories?}}`
//! with a status derived from the kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatrelay_core::{Error, ErrorKind};
use chatrelay_router::ChatError;
use serde::Serialize;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownPersona | ErrorKind::UnknownBackend | ErrorKind::SessionNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::ContentRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::SlotBusy | ErrorKind::NoBackendAvailable | ErrorKind::BackendUnreachable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::GenerationFailed | ErrorKind::LoadFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::InsufficientBudget | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: ErrorKind,
    reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    categories: Vec<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub reason: String,
    pub categories: Vec<String>,
}

impl ApiError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            reason: reason.into(),
            categories: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self {
            kind: e.kind,
            reason: e.reason,
            categories: e.categories,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let categories = match &e {
            Error::ContentRejected { categories, .. } => categories.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: e.kind(),
            reason: e.to_string(),
            categories,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind,
                reason: self.reason,
                categories: self.categories,
            },
        };
        (status, Json(body)).into_response()
    }
}

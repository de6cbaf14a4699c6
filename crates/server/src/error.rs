// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use history_index_core::IndexError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::SessionNotFound(id) => {
                tracing::warn!(session_id = %id, "Session not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Session not found", format!("Session ID: {}", id)),
                )
            }
            ApiError::ProjectNotFound(id) => {
                tracing::warn!(project_id = %id, "Project not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Project not found", format!("Project ID: {}", id)),
                )
            }
            ApiError::Index(index_err) => {
                let (status, error_msg) = match index_err {
                    IndexError::SessionNotFound(id) => {
                        tracing::warn!(session_id = %id, "Session not found");
                        (StatusCode::NOT_FOUND, "Session not found")
                    }
                    IndexError::RemoveTranscript { path, source }
                        if source.kind() == std::io::ErrorKind::PermissionDenied =>
                    {
                        tracing::error!(path = %path.display(), "Permission denied removing transcript");
                        (StatusCode::FORBIDDEN, "Permission denied")
                    }
                    IndexError::RemoveTranscript { path, source } => {
                        tracing::error!(path = %path.display(), error = %source, "Failed to remove transcript");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to remove transcript")
                    }
                    IndexError::RewriteLog { path, source } => {
                        tracing::error!(path = %path.display(), error = %source, "Failed to rewrite history log");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to rewrite history log")
                    }
                    IndexError::Join(e) => {
                        tracing::error!(error = %e, "Background task failed");
                        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                    }
                };
                // Task failures carry panic payloads; keep them out of responses.
                let body = match index_err {
                    IndexError::Join(_) => ErrorResponse::new(error_msg),
                    _ => ErrorResponse::with_details(error_msg, index_err.to_string()),
                };
                (status, body)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

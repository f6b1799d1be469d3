use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::error::FileServiceError;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<FileServiceError> for AppError {
    fn from(err: FileServiceError) -> Self {
        let status = match &err {
            FileServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            FileServiceError::InvalidState(_) => StatusCode::CONFLICT,
            FileServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            FileServiceError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FileServiceError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FileServiceError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // details stay in the log
            tracing::error!(error = %err, "request failed");
            return AppError::internal("internal server error");
        }
        if status.is_server_error() {
            tracing::warn!(error = %err, "request failed");
        }
        AppError::new(status, err.to_string())
    }
}

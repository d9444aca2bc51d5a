//! Error types for umig-import
//!
//! `ImportError` covers batch-level and orchestration failures. Row-level
//! problems are not errors; they travel as `RecordError` values in results.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::BatchStatus;

/// Import pipeline error
#[derive(Debug, Error)]
pub enum ImportError {
    /// Request-level validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Uniqueness or reference violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed input structure; the batch cannot continue
    #[error("Parse framing error: {0}")]
    ParseFraming(String),

    /// Orchestrator holds `capacity` requests already
    #[error("Import queue is full ({capacity} requests held), retry later")]
    QueueFull { capacity: usize },

    /// Per-batch lease not acquired in time
    #[error("Timed out after {waited_ms}ms waiting for lease on batch {batch_id}, retry later")]
    LockTimeout { batch_id: Uuid, waited_ms: u64 },

    #[error("Invalid status transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// Staging or master store failure
    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ImportError {
    /// Caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            ImportError::QueueFull { .. } | ImportError::LockTimeout { .. } => true,
            ImportError::Storage { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ImportError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Stable code for API bodies and logs
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Validation(_) => "VALIDATION_ERROR",
            ImportError::Conflict(_) => "CONFLICT_ERROR",
            ImportError::ParseFraming(_) => "PARSE_FRAMING_ERROR",
            ImportError::QueueFull { .. } => "QUEUE_FULL",
            ImportError::LockTimeout { .. } => "LOCK_TIMEOUT",
            ImportError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ImportError::Storage { .. } => "STORAGE_ERROR",
            ImportError::Unsupported(_) => "UNSUPPORTED",
            ImportError::NotFound(_) => "NOT_FOUND",
            ImportError::Cancelled(_) => "CANCELLED",
            ImportError::InvalidInput(_) => "INVALID_INPUT",
        }
    }
}

impl From<umig_common::Error> for ImportError {
    fn from(err: umig_common::Error) -> Self {
        let transient = err.is_database_locked();
        match err {
            umig_common::Error::NotFound(msg) => ImportError::NotFound(msg),
            umig_common::Error::InvalidInput(msg) => ImportError::InvalidInput(msg),
            other => ImportError::Storage {
                message: other.to_string(),
                transient,
            },
        }
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        umig_common::Error::Database(err).into()
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::storage(format!("Serialization failed: {}", err))
    }
}

pub type ImportResult<T> = Result<T, ImportError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Import pipeline error, mapped per variant
    #[error(transparent)]
    Import(#[from] ImportError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, bool) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", false),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false),
            ApiError::Import(err) => {
                let status = match err {
                    ImportError::NotFound(_) => StatusCode::NOT_FOUND,
                    ImportError::Validation(_)
                    | ImportError::ParseFraming(_)
                    | ImportError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    ImportError::InvalidTransition { .. } | ImportError::Conflict(_) => {
                        StatusCode::CONFLICT
                    }
                    ImportError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                    ImportError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    ImportError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                    ImportError::Cancelled(_) => StatusCode::CONFLICT,
                    ImportError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.is_retryable())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, retryable) = self.parts();
        if status.is_server_error() {
            tracing::error!(code = error_code, "Request failed: {}", self);
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

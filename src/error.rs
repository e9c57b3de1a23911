//! Error types for the sync core

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync core error type
///
/// Two conflicting versions of a record are not an error: divergence is the
/// resolver's normal input and always produces a resolution.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed input to a resolver/checksum/tracker call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checksum mismatch or hash-chain break
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Network failure, recoverable through queue backoff
    #[error("Transient sync error: {0}")]
    Transient(String),

    #[error("Remote call timed out after {0} seconds")]
    Timeout(u64),

    /// Non-success response from the remote authority
    #[error("Remote authority returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the failure should be retried through the queue's backoff
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient(_) | SyncError::Timeout(_) => true,
            SyncError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            SyncError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            SyncError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            SyncError::Integrity(msg) => {
                tracing::error!("Integrity error: {}", msg);
                (StatusCode::CONFLICT, "integrity_error", msg.clone())
            }
            SyncError::Transient(_) | SyncError::Timeout(_) | SyncError::Remote { .. } => {
                tracing::warn!("Remote error: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "remote_error",
                    "Remote authority unavailable".to_string(),
                )
            }
            SyncError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            SyncError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization_error",
                    "Failed to encode or decode a stored document".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

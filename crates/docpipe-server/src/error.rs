//! API error types for the docpipe server.
//!
//! Maps core domain errors to HTTP status codes and JSON error
//! responses. Ownership failures surface as 404 so document ids
//! cannot be enumerated.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type for route handlers.
pub enum ApiError {
    /// Request input failed validation (bad MIME, oversize, bad body).
    Validation {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        message: String,
    },
    /// Missing or unknown bearer token.
    Unauthorized,
    /// Requested resource not found (or owned by someone else).
    NotFound(String),
    /// The operation is not allowed in the document's current state.
    Conflict(String),
    /// Internal storage/database error.
    Storage(docpipe_core::error::StorageError),
    /// Object store failure.
    ObjectStore(docpipe_core::error::ObjectStoreError),
    /// Anything else.
    Internal(String),
}

impl From<docpipe_core::error::StorageError> for ApiError {
    fn from(err: docpipe_core::error::StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<docpipe_core::error::ObjectStoreError> for ApiError {
    fn from(err: docpipe_core::error::ObjectStoreError) -> Self {
        Self::ObjectStore(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // Input validation failures share the business-rule issue
            // shape so clients handle both uniformly.
            Self::Validation { field, message } => {
                let body = axum::Json(json!({
                    "error": format!("invalid {field}: {message}"),
                    "issues": [{ "field": field, "issue": message, "severity": "error" }],
                }));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            Self::Unauthorized => error_response(StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::NotFound(msg) => error_response(StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => error_response(StatusCode::CONFLICT, msg),
            Self::Storage(e) => {
                tracing::error!("storage error: {e}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Self::ObjectStore(e) => {
                tracing::error!("object store error: {e}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Self::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}

//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No route matched.
    #[error("not found: {0}")]
    NotFound(String),

    /// Counter store read failed.
    #[error("store error: {0}")]
    Store(#[from] sentinel_store::Error),
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::NotFound(path) => (
                StatusCode::NOT_FOUND,
                "not_found",
                Some(format!("no route for {path}")),
            ),
            Self::Store(err) => {
                tracing::error!(error = %err, "counter store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    Some("Failed to read counters".to_string()),
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

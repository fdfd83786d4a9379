//! Error types for mail-gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::request::Violation;
use crate::translate::TranslatedError;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
///
/// Every variant renders to a stable JSON body. Raw transport errors never
/// appear here: they are translated first.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or incomplete send request
    #[error("Validation failed with {} violation(s)", .0.len())]
    Validation(Vec<Violation>),

    /// Request body exceeds the configured limit
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Requested SMTP mode is not on the allow-list
    #[error("Mode not allowed: {mode}")]
    ModeNotAllowed { mode: String, allowed: Vec<String> },

    /// Translated transport failure
    #[error("Transport error: {0}")]
    Transport(TranslatedError),

    /// Unexpected failure inside the pipeline
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status this error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::ModeNotAllowed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Transport(translated) => translated.category.status(),
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            GatewayError::Validation(violations) => {
                json!({ "error": "Bad Request", "details": violations })
            }
            GatewayError::PayloadTooLarge(_) => json!({ "error": "Payload Too Large" }),
            GatewayError::ModeNotAllowed { mode, allowed } => json!({
                "error": "Mode not allowed",
                "details": { "mode": mode, "allowed": allowed },
            }),
            GatewayError::Transport(translated) => json!({
                "error": translated.category.title(),
                "category": translated.category,
                "details": { "code": translated.code, "message": translated.message },
            }),
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => {
                json!({ "error": "Internal Server Error" })
            }
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), "Request failed: {}", self);
        } else {
            warn!(status = status.as_u16(), "Request rejected: {}", self);
        }

        (status, Json(body)).into_response()
    }
}

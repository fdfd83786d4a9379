//! Translation of transport failures into HTTP-facing categories
//!
//! The mapping is total and deterministic: every [`TransportError`] lands in
//! exactly one [`ErrorCategory`], checked in priority order.

use axum::http::StatusCode;
use serde::Serialize;
use std::fmt;

use crate::transport::{codes, TransportError};

/// Transport codes the client can fix by changing the request
const UNPROCESSABLE_CODES: &[&str] = &[codes::AUTH, codes::ENVELOPE, codes::MESSAGE];

/// SMTP replies meaning credentials or envelope were refused
const UNPROCESSABLE_REPLIES: &[u16] = &[535, 530, 550, 553];

/// Transport codes worth retrying unchanged
const TRANSIENT_CODES: &[&str] = &[
    codes::CONNECTION,
    codes::TIMED_OUT,
    codes::SOCKET,
    codes::DNS_TEMPORARY,
    codes::SEND_TIMEOUT,
];

/// SMTP "service not available"
const TRANSIENT_REPLIES: &[u16] = &[421];

/// HTTP-facing failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Auth, envelope or content rejected; retrying unchanged will not help
    Unprocessable,
    /// Connection-level or deadline failure; safe to retry
    GatewayTimeout,
    /// Anything not classified above
    Internal,
}

impl ErrorCategory {
    /// HTTP status for this category
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCategory::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable title used as the `error` field
    pub fn title(self) -> &'static str {
        match self {
            ErrorCategory::Unprocessable => "Unprocessable Entity",
            ErrorCategory::GatewayTimeout => "Gateway Timeout",
            ErrorCategory::Internal => "Internal Server Error",
        }
    }
}

/// A transport failure after translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedError {
    pub category: ErrorCategory,
    /// Opaque transport code, kept for diagnostics
    pub code: String,
    pub message: String,
}

impl fmt::Display for TranslatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.category.title(), self.code, self.message)
    }
}

/// Classify a transport error
pub fn categorize(err: &TransportError) -> ErrorCategory {
    let code = err.code.as_str();
    let reply = err.response_code;
    let reply_in = |set: &[u16]| reply.is_some_and(|rc| set.contains(&rc));

    if UNPROCESSABLE_CODES.contains(&code) || reply_in(UNPROCESSABLE_REPLIES) {
        ErrorCategory::Unprocessable
    } else if TRANSIENT_CODES.contains(&code) || reply_in(TRANSIENT_REPLIES) {
        ErrorCategory::GatewayTimeout
    } else {
        ErrorCategory::Internal
    }
}

/// Translate a transport error, keeping its code and message
pub fn translate(err: &TransportError) -> TranslatedError {
    TranslatedError {
        category: categorize(err),
        code: err.code.clone(),
        message: err.message.clone(),
    }
}

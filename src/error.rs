//! # Error Handling
//!
//! Two kinds of failure live in this service:
//!
//! - **Request errors** ([`AppError`]) are returned from HTTP handlers and turned
//!   into JSON responses through actix-web's `ResponseError` trait.
//! - **Fatal errors** ([`fatal`]) come from the transcription worker when the
//!   shared engine or a delivery resource can no longer be trusted. They are
//!   logged and the process aborts.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "Session abc is not open",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Requested resource was not found (404)
    NotFound(String),

    /// The transcription worker is not running (503)
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(format!("Configuration error: {}", err))
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Log an unrecoverable condition and abort the process.
///
/// Used when continuing would mean running the shared engine or a delivery
/// resource in a state nobody can vouch for.
pub fn fatal(context: &str, reason: impl fmt::Display) -> ! {
    tracing::error!(context, reason = %reason, "Fatal error in transcription worker; aborting");
    std::process::abort()
}

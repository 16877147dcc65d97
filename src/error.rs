//! # Error Handling
//!
//! HTTP-facing error type. Domain modules keep their own `thiserror` enums
//! (`AudioError`, `RemoteError`, `SessionError`, ...); anything that can reach
//! an HTTP response is converted into `AppError` here.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### ResponseError trait
//! - **Purpose**: lets a handler return `Result<HttpResponse, AppError>` and have
//!   actix-web render the error as a proper HTTP response
//!
//! ### From trait
//! - **Purpose**: makes `?` convert lower-level errors automatically

use crate::gemini::RemoteError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: unexpected server-side failures (500)
/// - **BadRequest**: malformed client input (400)
/// - **ConfigError**: the server is not configured to do this (500)
/// - **ValidationError**: well-formed input that fails a rule (400)
/// - **Upstream**: the remote model endpoint is unreachable or failed (502)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Upstream(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
        }
    }
}

/// Render errors as JSON.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "upstream_error",
///     "message": "failed to connect to remote endpoint: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Upstream(msg) => ("upstream_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
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

/// JSON problems are almost always the caller's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// A missing API key is a deployment problem; everything else is the upstream's.
impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::InvalidArgument(msg) => AppError::ConfigError(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;

    #[test]
    fn test_remote_errors_map_to_status_codes() {
        let missing_key: AppError = RemoteError::InvalidArgument("API key is required".into()).into();
        assert_eq!(missing_key.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let unreachable: AppError = RemoteError::Connect("refused".into()).into();
        assert_eq!(unreachable.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::ValidationError("empty message".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "validation_error");
        assert_eq!(json["error"]["message"], "empty message");
        assert!(json["error"]["timestamp"].is_string());
    }
}

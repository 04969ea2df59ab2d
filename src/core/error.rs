//! # Error Handling
//!
//! Crate-wide error type built with `thiserror`. Every error maps to an HTTP
//! status so the request-handling layer can turn it into a response with
//! `IntoResponse`.
//!
//! Admission denials (rate ceilings, unhealthy channels) are deliberately
//! *not* represented here: they are ordinary outcomes of an admission check
//! and live in [`crate::admission::AdmissionDecision`]. What ends up in a
//! `GatewayError` is something that went wrong while trying to decide, such
//! as the shared rate-limit backend being unreachable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::cache::CacheError;
use crate::ratelimit::RateLimitError;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the admission-control gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The rate-limit backend could not answer; the request must not be admitted
    #[error("Rate limit check failed for {scope}: {reason}")]
    RateLimitCheckFailed { scope: String, reason: String },

    /// Shared cache failures outside of rate limiting (credential cache, etc.)
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Credential persistence failures reported by the store collaborator
    #[error("Credential store error: {message}")]
    CredentialStore { message: String },

    /// Lookup of something that does not exist
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a not found error with a custom message
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a credential store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::CredentialStore {
            message: message.into(),
        }
    }

    /// Wrap a rate-limit backend failure for the given limit scope
    pub fn rate_limit_check_failed<S: Into<String>>(scope: S, err: &RateLimitError) -> Self {
        Self::RateLimitCheckFailed {
            scope: scope.into(),
            reason: err.to_string(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    ///
    /// A failed rate-limit check is an internal error, never a 429: clients
    /// must be able to tell "the gateway could not decide" apart from
    /// "you are over budget".
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::RateLimitCheckFailed { .. }
            | Self::Cache { .. }
            | Self::CredentialStore { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitCheckFailed { .. } | Self::Cache { .. } | Self::Io { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RateLimitCheckFailed { .. } => "rate_limit_check_failed",
            Self::Cache { .. } => "cache_error",
            Self::CredentialStore { .. } => "credential_store_error",
            Self::NotFound { .. } => "not_found",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        Self::Cache {
            message: err.to_string(),
        }
    }
}

/// Converts errors into structured JSON responses for axum handlers
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::config("bad").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::not_found("channel 7").status_code(),
            StatusCode::NOT_FOUND
        );
        let backend = RateLimitError::Backend("connection refused".to_string());
        let err = GatewayError::rate_limit_check_failed("channel", &backend);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_type(), "rate_limit_check_failed");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_retryable_errors() {
        let backend = RateLimitError::Backend("timeout".to_string());
        assert!(GatewayError::rate_limit_check_failed("caller", &backend).is_retryable());
        assert!(!GatewayError::config("bad").is_retryable());
        assert!(!GatewayError::not_found("x").is_retryable());
    }

    #[test]
    fn test_config_error_macro() {
        let err = config_error!("invalid port: {}", 0);
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert_eq!(err.to_string(), "Configuration error: invalid port: 0");
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = GatewayError::not_found("monitor").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

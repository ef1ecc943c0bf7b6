//! Transport error types

use serde_json::Value;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, HttpError>;

/// Transport errors
#[derive(Debug, Error)]
pub enum HttpError {
    /// Network request failed before a response arrived
    #[error("Network request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid proxy configuration
    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    /// Remote answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    HttpStatus {
        status: reqwest::StatusCode,
        message: String,
        /// Parsed error body, when the server sent JSON
        payload: Option<Value>,
    },

    /// Response body was not valid JSON
    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Client build error
    #[error("Failed to build HTTP client: {0}")]
    BuildError(String),
}

impl HttpError {
    /// Check if error is retryable
    ///
    /// Only failures without a status and 5xx responses are retried. A 4xx
    /// response cannot succeed on retry and fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            HttpError::Timeout(_) => true,
            HttpError::HttpStatus { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// HTTP status of the failed response, if one was received
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            HttpError::RequestFailed(e) => e.status(),
            _ => None,
        }
    }

    /// Error payload returned by the server, if any
    pub fn payload(&self) -> Option<&Value> {
        match self {
            HttpError::HttpStatus { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn status_error(status: StatusCode) -> HttpError {
        HttpError::HttpStatus {
            status,
            message: "boom".to_string(),
            payload: None,
        }
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(status_error(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(HttpError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!status_error(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!status_error(StatusCode::CONFLICT).is_retryable());
        assert!(!status_error(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!HttpError::InvalidUrl("x".to_string()).is_retryable());
    }

    #[test]
    fn test_status_and_payload_accessors() {
        let err = HttpError::HttpStatus {
            status: StatusCode::CONFLICT,
            message: "App is locked".to_string(),
            payload: Some(serde_json::json!({ "message": "App is locked" })),
        };
        assert_eq!(err.status(), Some(StatusCode::CONFLICT));
        assert_eq!(err.payload().unwrap()["message"], "App is locked");
        assert_eq!(HttpError::Timeout(std::time::Duration::ZERO).status(), None);
    }
}

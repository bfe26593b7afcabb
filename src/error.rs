//! Error types for chatrelay.

use std::collections::BTreeMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Seconds advertised in the `Retry-After` header of every failure response.
pub const RETRY_AFTER_SECONDS: u64 = 5;

/// Main error type for chatrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited,

    /// The provider answered with a non-2xx status, or could not be reached
    /// (`status` is `None` for connection failures).
    #[error("Upstream request failed: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
        headers: BTreeMap<String, String>,
    },

    #[error("Max retries exceeded after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Upstream stream aborted: {0}")]
    StreamAborted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidInput,
    RateLimited,
    UpstreamTransient,
    UpstreamError,
    StreamAborted,
    Internal,
}

/// Normalized failure payload returned to the caller as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyError {
    pub name: &'static str,
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    pub suggestion: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl Error {
    /// Build an upstream error from a status code and message, without headers.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status: Some(status),
            message: message.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Whether the retry policy should try again after this error.
    ///
    /// Only provider rate limiting (429) qualifies. Connection failures and
    /// every other status are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upstream { status: Some(429), .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::RateLimited => ErrorKind::RateLimited,
            Error::Upstream { status: Some(429), .. } => ErrorKind::UpstreamTransient,
            Error::RetriesExhausted { .. } => ErrorKind::UpstreamTransient,
            Error::Upstream { .. } => ErrorKind::UpstreamError,
            Error::StreamAborted(_) => ErrorKind::StreamAborted,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for this error. Upstream statuses are mirrored; an absent
    /// or unrepresentable one falls back to 500.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Upstream { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::RetriesExhausted { .. }
            | Error::StreamAborted(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert into the caller-facing payload.
    pub fn to_proxy_error(&self) -> ProxyError {
        let status = self.status().as_u16();
        match self {
            Error::InvalidInput(message) => ProxyError {
                name: "InvalidInput",
                kind: self.kind(),
                status,
                message: format!("Invalid request: {}", message),
                suggestion: "Send a JSON body with a non-empty messages array",
                headers: BTreeMap::new(),
                retry_after_seconds: None,
            },
            Error::RateLimited => ProxyError {
                name: "RateLimited",
                kind: self.kind(),
                status,
                message: self.to_string(),
                suggestion: "Please try again later",
                headers: BTreeMap::new(),
                retry_after_seconds: None,
            },
            Error::Upstream {
                message, headers, ..
            } => ProxyError {
                name: "UpstreamError",
                kind: self.kind(),
                status,
                message: message.clone(),
                suggestion: "Please try again in a few moments",
                headers: headers.clone(),
                retry_after_seconds: Some(RETRY_AFTER_SECONDS),
            },
            Error::RetriesExhausted { .. } => ProxyError {
                name: "RetriesExhausted",
                kind: self.kind(),
                status,
                message: self.to_string(),
                suggestion: "Please try again in a few moments",
                headers: BTreeMap::new(),
                retry_after_seconds: Some(RETRY_AFTER_SECONDS),
            },
            Error::Internal(_) | Error::StreamAborted(_) => ProxyError {
                name: "Error",
                kind: self.kind(),
                status,
                message: "An error occurred while processing your request".to_string(),
                suggestion: "Please try again later",
                headers: BTreeMap::new(),
                retry_after_seconds: None,
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let payload = self.to_proxy_error();
        let mut response = (self.status(), axum::Json(payload)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECONDS));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_only_upstream_429_is_retryable() {
        assert!(Error::upstream(429, "slow down").is_retryable());
        assert!(!Error::upstream(500, "boom").is_retryable());
        assert!(!Error::upstream(503, "unavailable").is_retryable());
        assert!(!Error::RateLimited.is_retryable());
        assert!(!Error::Upstream {
            status: None,
            message: "connection reset".to_string(),
            headers: BTreeMap::new(),
        }
        .is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Error::upstream(401, "no key").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::upstream(502, "bad").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::Upstream {
                status: None,
                message: "refused".into(),
                headers: BTreeMap::new(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::RetriesExhausted {
                attempts: 3,
                message: "429".into()
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::upstream(429, "x").kind(), ErrorKind::UpstreamTransient);
        assert_eq!(Error::upstream(500, "x").kind(), ErrorKind::UpstreamError);
        assert_eq!(
            Error::StreamAborted("cut".into()).kind(),
            ErrorKind::StreamAborted
        );
        assert_eq!(Error::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_upstream_error_response_preserves_provider_details() {
        let mut headers = BTreeMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "0".to_string());
        let err = Error::Upstream {
            status: Some(503),
            message: "Provider overloaded".to_string(),
            headers,
        };

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");

        let json = body_json(response).await;
        assert_eq!(json["kind"], "UpstreamError");
        assert_eq!(json["status"], 503);
        assert_eq!(json["message"], "Provider overloaded");
        assert_eq!(json["headers"]["x-ratelimit-remaining"], "0");
        assert_eq!(json["suggestion"], "Please try again in a few moments");
    }

    #[tokio::test]
    async fn test_internal_error_response_is_generic() {
        let response = Error::Internal("secret detail".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");

        let json = body_json(response).await;
        assert_eq!(
            json["message"],
            "An error occurred while processing your request"
        );
        assert!(json.get("headers").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = Error::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
        let json = body_json(response).await;
        assert_eq!(json["kind"], "RateLimited");
        assert!(json.get("retry_after_seconds").is_none());
    }
}

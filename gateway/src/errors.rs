use std::fmt::Debug;

use reqwest::{header::RETRY_AFTER, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::transport::ApiResponse;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Everything a call through the gateway can fail with.
///
/// Only `AuthenticationExpired` is recovered from automatically (by the refresh cycle).
/// Every other variant is logged and handed back to the caller as-is.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A protected route was called without a usable access token. Nothing was sent.
    #[error("no valid access token for protected route {path}")]
    MissingCredentials { path: String },

    /// The CSRF token endpoint was unreachable or answered without a token.
    #[error("failed to fetch CSRF token: {0}")]
    CsrfFetch(String),

    /// The backend rejected the access token and no refresh could be attempted
    /// (public route, or the request was already replayed once).
    #[error("authentication expired for {path}")]
    AuthenticationExpired { path: String },

    /// A sign-in style call was refused by the backend.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The refresh endpoint rejected us. The session has been torn down.
    #[error("session terminated, token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("permission denied: {message}")]
    PermissionDenied { csrf: bool, message: String },

    #[error("resource not found: {path}")]
    NotFound { path: String },

    #[error("request rejected as invalid: {details}")]
    Validation { details: Value },

    #[error("too many requests, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    #[error("server error {status}: {message}")]
    Server { status: StatusCode, message: String },

    #[error("unexpected status {status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid header value for {0}")]
    InvalidHeader(String),

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Classify a non-success response into the matching error variant.
    pub fn from_response(path: &str, response: &ApiResponse) -> Self {
        let status = response.status;
        let message = error_message(response);

        match status {
            StatusCode::UNAUTHORIZED => GatewayError::AuthenticationExpired {
                path: path.to_string(),
            },
            StatusCode::FORBIDDEN => GatewayError::PermissionDenied {
                csrf: crate::csrf::is_csrf_rejection(response),
                message,
            },
            StatusCode::NOT_FOUND => GatewayError::NotFound {
                path: path.to_string(),
            },
            StatusCode::UNPROCESSABLE_ENTITY => GatewayError::Validation {
                details: response
                    .json_value()
                    .unwrap_or_else(|| Value::String(message)),
            },
            StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited {
                retry_after: response
                    .headers
                    .get(RETRY_AFTER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.trim().parse().ok()),
            },
            s if s.is_server_error() => GatewayError::Server { status, message },
            _ => GatewayError::Http { status, message },
        }
    }

    /// The HTTP status behind this error, if it came from a backend response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::AuthenticationExpired { .. } | GatewayError::InvalidCredentials => {
                Some(StatusCode::UNAUTHORIZED)
            }
            GatewayError::PermissionDenied { .. } => Some(StatusCode::FORBIDDEN),
            GatewayError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            GatewayError::Validation { .. } => Some(StatusCode::UNPROCESSABLE_ENTITY),
            GatewayError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            GatewayError::Server { status, .. } | GatewayError::Http { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Whether this error means the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            GatewayError::MissingCredentials { .. } | GatewayError::RefreshFailed { .. }
        )
    }
}

/// Pull a human readable message out of an error body.
///
/// Backends answer `{"error": ...}` or `{"message": ...}`; anything else falls back
/// to the raw text, then to the status' canonical reason.
pub(crate) fn error_message(response: &ApiResponse) -> String {
    if let Some(body) = response.json_value() {
        for field in ["error", "message"] {
            if let Some(text) = body.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }

    let text = response.text();
    if !text.trim().is_empty() {
        return text;
    }

    response
        .status
        .canonical_reason()
        .unwrap_or("unknown error")
        .to_string()
}

//! Error types for singsync-id
//!
//! Engine failures never reach this module: they become `ok: false` result cards.
//! [`IdentifyError`] covers request-level failures reported before any fan-out,
//! and [`ApiError`] maps everything onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use singsync_common::ErrorKind;
use thiserror::Error;

/// Request-level identification error
#[derive(Debug, Error)]
pub enum IdentifyError {
    /// Unknown or expired sample token
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Selection resolved to zero enabled engines
    #[error("No engines enabled for this run")]
    NoEnginesEnabled,

    /// Requested engine name is not registered
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Malformed request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Text search has no usable backend (credentials missing)
    #[error("Text search unavailable: {0}")]
    TextSearchUnavailable(String),

    /// Text search backend failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl IdentifyError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            IdentifyError::InvalidToken(_) => "INVALID_TOKEN",
            IdentifyError::NoEnginesEnabled => "NO_ENGINES",
            IdentifyError::UnknownEngine(_) => "UNKNOWN_ENGINE",
            IdentifyError::InvalidInput(_) => "BAD_REQUEST",
            IdentifyError::TextSearchUnavailable(_) => "MISSING_CREDENTIALS",
            IdentifyError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }

    /// Corresponding error kind where one exists
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            IdentifyError::InvalidToken(_) => Some(ErrorKind::InvalidToken),
            IdentifyError::TextSearchUnavailable(_) => Some(ErrorKind::MissingCredentials),
            IdentifyError::Upstream(_) => Some(ErrorKind::UpstreamError),
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            IdentifyError::InvalidToken(_)
            | IdentifyError::NoEnginesEnabled
            | IdentifyError::UnknownEngine(_)
            | IdentifyError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            IdentifyError::TextSearchUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IdentifyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request understood but missing required content (422)
    #[error("Unprocessable request: {0}")]
    Unprocessable(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identification request error
    #[error(transparent)]
    Identify(#[from] IdentifyError),

    /// singsync-common error
    #[error("Common error: {0}")]
    Common(#[from] singsync_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Identify(ref err) => (err.status(), err.code(), err.to_string()),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "ok": false,
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_error_codes() {
        assert_eq!(IdentifyError::InvalidToken("x".into()).code(), "INVALID_TOKEN");
        assert_eq!(IdentifyError::NoEnginesEnabled.code(), "NO_ENGINES");
        assert_eq!(
            IdentifyError::InvalidToken("x".into()).kind(),
            Some(ErrorKind::InvalidToken)
        );
    }

    #[test]
    fn test_invalid_token_is_bad_request() {
        let response = ApiError::from(IdentifyError::InvalidToken("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_upload_is_unprocessable() {
        let response = ApiError::Unprocessable("file field required".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}

//! HTTP error bodies.

use crate::metrics;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use synclink_core::topic::TopicError;
use synclink_core::{AuthError, BridgeError, ErrorKind, StoreError, SyncError};
use thiserror::Error;

/// An error returned by an API handler, rendered as
/// `{"error": kind, "message": ..., "retryable": bool}`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    kind: ErrorKind,
    status: StatusCode,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = match kind {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Store => StatusCode::BAD_GATEWAY,
            ErrorKind::ConnectionLost | ErrorKind::SlowConsumer => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportUnavailable, message)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.kind.as_str());
        let body = json!({
            "error": self.kind.as_str(),
            "message": self.message,
            "retryable": self.kind.is_retryable(),
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let mut api = Self::new(err.kind(), err.to_string());
        if matches!(err, StoreError::NotFound(_)) {
            api.status = StatusCode::NOT_FOUND;
        }
        api
    }
}

impl From<TopicError> for ApiError {
    fn from(err: TopicError) -> Self {
        Self::new(ErrorKind::InvalidRequest, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_kind() {
        assert_eq!(
            ApiError::from(AuthError::Expired).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::unavailable("bus down").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(StoreError::Unavailable("db".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("session s9".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(TopicError::Empty).kind(),
            ErrorKind::InvalidRequest
        );
    }
}

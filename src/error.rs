//! Error taxonomy for the engine and the storage port.
//!
//! Authentication failures map to `401`, authorization failures to `403` and
//! everything else to `500`. The `500` body never carries the cause; the cause
//! chain is logged instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid record encoding: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no connection available after {0:?}")]
    PoolTimeout(Duration),
    #[error("invalid storage configuration: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("login info not found")]
    LoginInfoNotFound,
    #[error("session not found")]
    SessionNotFound,
    #[error("refresh token not found")]
    RefreshTokenNotFound,
    #[error("refresh token expired")]
    RefreshTokenExpired,
    #[error("role provider not configured")]
    RoleProviderNotConfigured,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("role not found: {0}")]
    RoleNotFound(String),
    #[error("failed to fetch user roles")]
    RoleProvider(#[source] anyhow::Error),
    #[error("token generation failed: {0}")]
    TokenGeneration(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to {operation}")]
    Storage {
        operation: &'static str,
        #[source]
        source: StorageError,
    },
}

impl Error {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| Self::Storage { operation, source }
    }

    /// True when the operation stopped because the caller's context was
    /// cancelled or ran past its deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                source: StorageError::Cancelled | StorageError::DeadlineExceeded,
                ..
            }
        )
    }

    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound
                | Self::TokenExpired
                | Self::LoginInfoNotFound
                | Self::SessionNotFound
                | Self::RefreshTokenNotFound
                | Self::RefreshTokenExpired
        )
    }

    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::RoleNotFound(_))
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        if self.is_unauthenticated() {
            StatusCode::UNAUTHORIZED
        } else if self.is_forbidden() {
            StatusCode::FORBIDDEN
        } else if matches!(self, Self::InvalidRequest(_)) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?anyhow::Error::from(self), "internal auth error");
            return (status, Json(json!({ "error": "internal error" }))).into_response();
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_map_to_unauthorized() {
        for err in [
            Error::TokenNotFound,
            Error::TokenExpired,
            Error::LoginInfoNotFound,
            Error::RefreshTokenExpired,
        ] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{err}");
        }
    }

    #[test]
    fn evaluator_denials_map_to_forbidden() {
        assert_eq!(
            Error::PermissionDenied("user:delete".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::RoleNotFound("admin".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn storage_failures_map_to_internal_error() {
        let err = Error::Storage {
            operation: "create session",
            source: StorageError::Config("boom".to_string()),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "failed to create session");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancellation_is_visible_through_the_wrapper() {
        let err = Error::storage("load login info")(StorageError::Cancelled);
        assert!(err.is_cancelled());
        let err = Error::storage("load login info")(StorageError::DeadlineExceeded);
        assert!(err.is_cancelled());
    }

    #[test]
    fn internal_errors_hide_the_cause_in_responses() {
        let response = Error::RoleProviderNotConfigured.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = Error::InvalidRequest("user id is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

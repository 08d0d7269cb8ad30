//! Typed errors for the POS domain layer and HTTP handlers.
//!
//! Every domain operation returns [`PosResult`]. Handlers return the error
//! directly; the [`IntoResponse`] impl maps each variant to a status code and
//! a `{ "success": false, "code": ..., "error": ... }` body. Database and
//! internal failures are logged with their detail and answered with a
//! generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum PosError {
    /// Request body failed validation.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    /// Unique constraint or state conflict.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    /// Optional integration is not configured.
    #[error("{0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failure talking to a third-party service.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PosResult<T> = Result<T, PosError>;

impl PosError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PosError::Validation(_) => StatusCode::BAD_REQUEST,
            PosError::NotFound(_) => StatusCode::NOT_FOUND,
            PosError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PosError::Forbidden(_) => StatusCode::FORBIDDEN,
            PosError::Conflict(_) => StatusCode::CONFLICT,
            PosError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            PosError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PosError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PosError::Database(_) | PosError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code the sync client uses to tell a real missing record apart
    /// from a proxy or gateway 404.
    pub fn error_code(&self) -> &'static str {
        match self {
            PosError::Validation(_) => "VALIDATION_ERROR",
            PosError::NotFound(_) => "NOT_FOUND",
            PosError::Unauthorized(_) => "UNAUTHORIZED",
            PosError::Forbidden(_) => "FORBIDDEN",
            PosError::Conflict(_) => "CONFLICT",
            PosError::RateLimited(_) => "RATE_LIMITED",
            PosError::Unavailable(_) => "UNAVAILABLE",
            PosError::Database(_) => "DATABASE_ERROR",
            PosError::Upstream(_) => "UPSTREAM_ERROR",
            PosError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            PosError::Database(_) | PosError::Internal(_) => "Error interno del servidor".into(),
            PosError::Upstream(_) => "Servicio externo no disponible".into(),
            other => other.to_string(),
        }
    }

    /// Convenience for mutex poisoning and other "cannot happen" failures.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        PosError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(err: serde_json::Error) -> Self {
        PosError::Validation(format!("Invalid JSON payload: {err}"))
    }
}

impl IntoResponse for PosError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "success": false,
            "code": self.error_code(),
            "error": self.public_message(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            PosError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PosError::RateLimited("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PosError::Validation("x".into()).error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = PosError::Internal("mutex poisoned at orders.rs".into());
        assert_eq!(err.public_message(), "Error interno del servidor");
        let err = PosError::Validation("Cédula requerida".into());
        assert_eq!(err.public_message(), "Cédula requerida");
    }
}

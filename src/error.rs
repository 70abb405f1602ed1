//! Error types for the gateway

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only, fatal)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token failed signature, expiry or shape validation
    #[error("Invalid token")]
    InvalidToken,

    /// Session id is present in the revocation set
    #[error("Session revoked")]
    SessionRevoked,

    /// Caller does not have the admin role
    #[error("Forbidden")]
    Forbidden,

    /// No service prefix matches the request path
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The matched service has no selectable instance
    #[error("No instance available for service: {0}")]
    NoInstance(String),

    /// Transport failure while proxying to a backend
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// User database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Session store (Redis) error
    #[error("Session store error: {0}")]
    SessionStore(#[from] redis::RedisError),

    /// Discovery store (etcd) error
    #[error("Discovery error: {0}")]
    Discovery(#[from] etcd_client::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the edge
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::SessionRevoked => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            Self::NoInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // The 502 body is part of the proxy contract and fixed verbatim.
        let body = match &self {
            Error::Upstream(_) => json!({"error": "backend service error"}),
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

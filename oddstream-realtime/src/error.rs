//! Service error types.
//!
//! This module provides the top-level error type for the realtime service
//! and its HTTP mapping for the upgrade surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;

/// Realtime service error type.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Credential missing or invalid
    #[error("unauthorized")]
    Unauthorized,

    /// Origin header missing or not in the allowed set
    #[error("origin not allowed")]
    OriginForbidden,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Authenticator construction or signing error
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Upstream bus error
    #[error("bus consumer error: {0}")]
    Bus(String),

    /// Server bind or serve error
    #[error("server error: {0}")]
    Server(String),
}

impl RealtimeError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::OriginForbidden => StatusCode::FORBIDDEN,
            Self::Config(_) | Self::Bus(_) | Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RealtimeError {
    fn into_response(self) -> Response {
        // Plain-text bodies only; clients are told nothing beyond the kind.
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Result type alias for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

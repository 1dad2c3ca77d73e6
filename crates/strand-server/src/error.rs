// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the strand server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use strand_core::EngineError;

/// Result type using ServerError.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the server layer.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration loading or validation failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A registry database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Running registry migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The engine rejected an operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The caller presented an unknown event key.
    #[error("unauthorized")]
    Unauthorized,

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Engine(EngineError::Validation { .. }) => StatusCode::BAD_REQUEST,
            Self::Engine(e) if e.is_idempotent_duplicate() => StatusCode::CONFLICT,
            Self::Serde(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Engine(e) => e.error_code(),
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Serde(_) => "SERDE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": { "code": self.error_code(), "message": self.to_string() },
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServerError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::Config("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServerError::Engine(EngineError::RunExists("r".into())).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_engine_codes_pass_through() {
        let err = ServerError::Engine(EngineError::RateLimited("k".into()));
        assert_eq!(err.error_code(), "RATE_LIMITED");
    }
}

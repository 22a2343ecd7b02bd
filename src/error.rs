// src/error.rs
//
// =============================================================================
// CONDUCTOR: ERROR TAXONOMY (v 0.1)
// =============================================================================
//
// Business errors never cross the daemon boundary without being recorded on
// the job row first; only the top-level role loops in main.rs catch these
// generically. The HTTP front-end maps the taxonomy to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("illegal state transition: {0}")]
    IllegalState(String),

    #[error("infrastructure not initialized: {0}")]
    Infrastructure(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("kv/queue error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;

impl ConductorError {
    /// True for the "cancel on an already-terminal job" case, treated as an
    /// idempotent no-op rather than a hard error.
    pub fn is_idempotent_cancel(&self) -> bool {
        matches!(self, ConductorError::IllegalState(msg) if msg.contains("already terminal"))
    }
}

impl IntoResponse for ConductorError {
    fn into_response(self) -> Response {
        if self.is_idempotent_cancel() {
            return (StatusCode::OK, Json(json!({"msg": "取消成功"}))).into_response();
        }

        let status = match &self {
            ConductorError::Validation(_) => StatusCode::BAD_REQUEST,
            ConductorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ConductorError::IllegalState(_) => StatusCode::BAD_REQUEST,
            ConductorError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ConductorError::Db(_)
            | ConductorError::Pool(_)
            | ConductorError::Kv(_)
            | ConductorError::Io(_)
            | ConductorError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        log::error!("request failed: {}", self);
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transient stream failure (timeout, reset, refused). The puller retries.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The stream exceeded its failure budget and is considered dead.
    #[error("Stream dead: {0}")]
    StreamDead(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Permanent external-service failure (4xx, auth, quota). Not retried.
    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Station limit reached ({0} active)")]
    StationLimit(usize),

    /// Broken pipeline assumption (e.g. non-monotonic timestamps). Fatal for
    /// the affected station only; the supervisor restarts its pipeline.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Transient errors are retried at the nearest boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Stream(_) => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::StationLimit(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::ExternalApi(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Http(ref e) => {
                tracing::error!("Upstream HTTP error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "Upstream error".to_string())
            }
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

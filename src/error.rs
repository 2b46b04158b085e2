//! Error types for sproutd.
//!
//! One taxonomy shared by HTTP controllers, the WebSocket endpoint, and
//! broker dispatch: controllers map variants to status codes here, broker
//! branches log and swallow them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Referenced entity absent.
    #[error("{0}")]
    NotFound(String),

    /// Entity exists but is in the wrong temporal/state condition
    /// (expired pairing window).
    #[error("{0}")]
    IllegalState(String),

    /// Ownership/ACL mismatch.
    #[error("{0}")]
    IllegalArgument(String),

    /// A write affected zero rows unexpectedly.
    #[error("{0}")]
    Conflict(String),

    /// Caller lacks credentials for the resource.
    #[error("{0}")]
    Unauthorized(String),

    /// Malformed request payload.
    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Neither a pool nor an external connection is configured.
    #[error("no database pool and no external connection available")]
    PoolUnavailable,

    /// Operation attempted on a handle whose connection was already
    /// given back.
    #[error("database handle already released")]
    HandleReleased,

    /// Publish requested while running without a broker.
    #[error("MQTT client not initialised")]
    BrokerUnavailable,

    #[error("broker error: {0}")]
    Broker(#[from] rumqttc::ClientError),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Token minting failed. Decode failures are mapped to the 401
    /// variants at the call site instead.
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::IllegalState(_) => StatusCode::NOT_FOUND,
            AppError::IllegalArgument(_) | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Db(_)
            | AppError::PoolUnavailable
            | AppError::HandleReleased
            | AppError::BrokerUnavailable
            | AppError::Broker(_)
            | AppError::Json(_)
            | AppError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal detail stays in the log, not the response body.
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self}");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

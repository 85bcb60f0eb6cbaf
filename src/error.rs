// Error kinds surfaced by the core, per the error handling design: each variant carries enough
// context to both render an HTTP response and an SSE `error` event with the same message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("busy")]
    Busy,

    #[error("launch already in progress")]
    InProgress,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("submit failed: {0}")]
    Submit(String),

    #[error("timed out waiting for node assignment")]
    Timeout,

    #[error("job no longer in queue")]
    JobGone,

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Spec §5 "Cancellation semantics": the SSE client disconnected while this operation was
    /// still in flight. Never rendered to a live client -- by the time this is constructed, the
    /// connection it would have been sent over is already gone.
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Busy => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InProgress => StatusCode::BAD_REQUEST,
            GatewayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Submit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::JobGone => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Tunnel(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

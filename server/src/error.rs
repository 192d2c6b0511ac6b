use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tts_core::PipelineError;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Client {0} is not connected")]
    ClientNotConnected(u64),

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Speech provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::ClientNotConnected(id) => ApiError::ClientNotConnected(id),
            PipelineError::EmptyText => ApiError::InvalidInput("Text cannot be empty".to_string()),
            PipelineError::Synthesis(reason) => ApiError::SynthesisFailed(reason.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ClientNotConnected(id) => (
                StatusCode::CONFLICT,
                format!("Client {id} has no open WebSocket connection"),
            ),
            ApiError::SynthesisFailed(msg) => {
                tracing::warn!("Synthesis failed: {}", msg);
                (StatusCode::BAD_GATEWAY, format!("Synthesis failed: {msg}"))
            }
            ApiError::ProviderUnavailable(msg) => {
                tracing::warn!("Speech provider unavailable: {}", msg);
                (StatusCode::BAD_GATEWAY, format!("Speech provider unavailable: {msg}"))
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

use crate::ws::connections::AdmissionError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP callers.
///
/// Signaling and media failures never reach the viewer; only a refused
/// upgrade is reported, as a status code.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Service unavailable: {0}")]
    Unavailable(#[from] AdmissionError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unavailable(reason) => {
                tracing::warn!("Refusing viewer: {}", reason);
                (StatusCode::SERVICE_UNAVAILABLE, reason.to_string())
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

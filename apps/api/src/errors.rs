use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::hearing::error::{FailureKind, FailurePhase, PipelineError};

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<Value>) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::PayloadTooLarge(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                msg.clone(),
                None,
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    None,
                )
            }
            AppError::Pipeline(e) => pipeline_parts(e),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    None,
                )
            }
        }
    }
}

fn pipeline_parts(e: &PipelineError) -> (StatusCode, &'static str, String, Option<Value>) {
    let details = json!({
        "phase": e.phase,
        "kind": e.kind,
        "retry_count": e.retry_count,
        "issues": e.issues,
    });

    if e.kind == FailureKind::Cancelled {
        return (
            StatusCode::REQUEST_TIMEOUT,
            "HEARING_CANCELLED",
            "The hearing was cancelled before it completed".to_string(),
            Some(details),
        );
    }

    match e.phase {
        FailurePhase::Transcription => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "TRANSCRIPTION_FAILED",
            "The recording could not be transcribed. Please record again".to_string(),
            Some(details),
        ),
        FailurePhase::Extraction | FailurePhase::Validation => {
            tracing::warn!("Hearing extraction failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                "EXTRACTION_FAILED",
                "The answers could not be turned into résumé fields".to_string(),
                Some(details),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();

        let mut error = json!({
            "code": code,
            "message": message
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

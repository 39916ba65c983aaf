//! Error handling for the REST API.
//!
//! All endpoints return `AppError` on failure. Internal details are
//! logged server side; the client receives a structured JSON error
//! body. The index build endpoint additionally attaches per-table,
//! per-worker and per-chunk sub-errors.

use axum::{http::StatusCode, response::IntoResponse, Json};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    /// A failure with extended detail, e.g. per-worker sub-errors of
    /// an index build.
    Extended { status: StatusCode, error: String, extended: serde_json::Value },
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AppError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message })))
                    .into_response()
            }
            AppError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message })))
                    .into_response()
            }
            AppError::Internal(message) => {
                // Log full details server side, return a generic
                // message to the client.
                tracing::error!(details = %message, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "an internal error occurred" })),
                )
                    .into_response()
            }
            AppError::Extended { status, error, extended } => (
                status,
                Json(serde_json::json!({ "error": error, "extended": extended })),
            )
                .into_response(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(format!("database error: {err}"))
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("API key is required")]
    AuthMissing,

    #[error("invalid API key")]
    AuthUnknown,

    #[error("API key is not active")]
    AuthInactive,

    #[error("API key has expired")]
    AuthExpired,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::GeminiKeyNotFound => AppError::NotFound("Gemini key not found".into()),
            StoreError::ClientKeyNotFound => AppError::NotFound("Client key not found".into()),
            StoreError::Sqlx(e) => AppError::Database(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::AuthMissing | AppError::AuthUnknown => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::AuthInactive | AppError::AuthExpired => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database error".into())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".into(),
                )
            }
        };

        let body = Json(json!({ "error": msg }));
        (status, body).into_response()
    }
}

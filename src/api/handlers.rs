use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::server::AppState;
use crate::store::NewClientKey;

// -- Gemini key handlers --

#[derive(Debug, Deserialize)]
pub struct ListGeminiKeysQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, rename = "minFailureCount")]
    pub min_failure_count: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    10
}

fn default_status() -> String {
    "all".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateGeminiKeyRequest {
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateGeminiKeyRequest {
    pub key: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<i64>,
}

pub async fn list_gemini_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListGeminiKeysQuery>,
) -> Result<Response, AppError> {
    let (keys, total) = state
        .db
        .list_gemini_keys(query.page, query.limit, &query.status, query.min_failure_count)
        .await?;
    Ok(Json(json!({ "keys": keys, "total": total })).into_response())
}

pub async fn create_gemini_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGeminiKeyRequest>,
) -> Result<Response, AppError> {
    if req.key.is_empty() {
        return Err(AppError::BadRequest("key is required".into()));
    }
    let key = state.db.create_gemini_key(&req.key).await?;
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

pub async fn get_gemini_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let key = state.db.get_gemini_key(id).await?;
    Ok(Json(key).into_response())
}

pub async fn update_gemini_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateGeminiKeyRequest>,
) -> Result<Response, AppError> {
    let mut key = state.db.get_gemini_key(id).await?;
    if let Some(secret) = req.key {
        if !secret.is_empty() {
            key.secret = secret;
        }
    }
    if let Some(status) = req.status {
        if !status.is_empty() {
            key.status = status;
        }
    }
    state.db.update_gemini_key(&key).await?;
    Ok(Json(key).into_response())
}

pub async fn delete_gemini_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    state.db.delete_gemini_key(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn batch_create_gemini_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchCreateRequest>,
) -> Result<Response, AppError> {
    state.db.batch_add_gemini_keys(&req.keys).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"message": "Keys created successfully"})),
    )
        .into_response())
}

pub async fn batch_delete_gemini_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchDeleteRequest>,
) -> Result<Response, AppError> {
    state.db.batch_delete_gemini_keys(&req.ids).await?;
    Ok(Json(json!({"message": "Keys deleted successfully"})).into_response())
}

/// Probe one key right now and report the outcome synchronously.
pub async fn test_gemini_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.pool.test_key_by_id(id).await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "failed", "error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn test_all_gemini_keys(State(state): State<Arc<AppState>>) -> Response {
    state.pool.clone().test_all_keys_async();
    (
        StatusCode::ACCEPTED,
        Json(json!({"message": "Batch key test initiated in the background."})),
    )
        .into_response()
}

// -- Client key handlers --

#[derive(Debug, Deserialize)]
pub struct CreateClientKeyRequest {
    pub key: String,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub rate_limit: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateClientKeyRequest {
    pub key: Option<String>,
    pub status: Option<String>,
    pub permissions: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn list_client_keys(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let keys = state.db.list_client_keys().await?;
    Ok(Json(keys).into_response())
}

pub async fn create_client_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClientKeyRequest>,
) -> Result<Response, AppError> {
    if req.key.is_empty() {
        return Err(AppError::BadRequest("key is required".into()));
    }
    let key = state
        .db
        .create_client_key(&NewClientKey {
            secret: req.key,
            permissions: req.permissions,
            rate_limit: req.rate_limit,
            expires_at: req.expires_at,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

pub async fn get_client_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let key = state.db.get_client_key(id).await?;
    Ok(Json(key).into_response())
}

pub async fn update_client_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateClientKeyRequest>,
) -> Result<Response, AppError> {
    let mut key = state.db.get_client_key(id).await?;
    if let Some(secret) = req.key {
        if !secret.is_empty() {
            key.secret = secret;
        }
    }
    if let Some(status) = req.status {
        if !status.is_empty() {
            key.status = status;
        }
    }
    if let Some(permissions) = req.permissions {
        if !permissions.is_empty() {
            key.permissions = permissions;
        }
    }
    if req.expires_at.is_some() {
        key.expires_at = req.expires_at;
    }
    state.db.update_client_key(&key).await?;
    Ok(Json(key).into_response())
}

pub async fn delete_client_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    state.db.delete_client_key(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn reset_client_key_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    state.db.reset_client_key_usage(id).await?;
    Ok(Json(json!({"message": "Usage count reset"})).into_response())
}

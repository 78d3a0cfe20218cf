//! Client authentication for the proxy routes.
//!
//! Callers present a client key either OpenAI-style (`Authorization:
//! Bearer …`) or Gemini-style (`x-goog-api-key`). The key is looked up in
//! the store on every request; usage accounting happens off the request
//! path.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use crate::errors::AppError;
use crate::server::AppState;
use crate::store::StoreError;

pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_client_token(req.headers()).ok_or(AppError::AuthMissing)?;

    let key = match state.db.find_client_key(&token).await {
        Ok(key) => key,
        Err(StoreError::ClientKeyNotFound) => return Err(AppError::AuthUnknown),
        Err(StoreError::Sqlx(e)) => return Err(AppError::Database(e)),
        Err(StoreError::GeminiKeyNotFound) => return Err(AppError::AuthUnknown),
    };

    if !key.is_active() {
        return Err(AppError::AuthInactive);
    }
    if key.is_expired(Utc::now()) {
        return Err(AppError::AuthExpired);
    }

    // Best-effort: the increment must not delay the request.
    let store = state.db.clone();
    tokio::spawn(async move {
        let _ = store.increment_client_key_usage(&token).await;
    });

    Ok(next.run(req).await)
}

fn extract_client_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_client_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_goog_api_key_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("gk-1"));
        assert_eq!(extract_client_token(&headers).as_deref(), Some("gk-1"));
    }

    #[test]
    fn test_bearer_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("other"));
        assert_eq!(extract_client_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn test_non_bearer_authorization_falls_through() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(extract_client_token(&headers), None);
    }

    #[test]
    fn test_missing_headers() {
        assert_eq!(extract_client_token(&HeaderMap::new()), None);
    }
}

//! HTTP Basic authentication for the admin surface.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde_json::json;

use crate::server::AppState;

pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    match basic_credentials(req.headers()) {
        Some((user, password)) if user == "admin" && password == state.config.admin.password => {
            next.run(req).await
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Basic realm=\"Restricted\"")],
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response(),
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_parses_valid_basic_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
        let headers = headers_with(&format!("Basic {encoded}"));
        assert_eq!(
            basic_credentials(&headers),
            Some(("admin".into(), "hunter2".into()))
        );
    }

    #[test]
    fn test_rejects_non_basic_schemes() {
        assert_eq!(basic_credentials(&headers_with("Bearer token")), None);
    }

    #[test]
    fn test_rejects_malformed_payload() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("no-colon-here");
        assert_eq!(
            basic_credentials(&headers_with(&format!("Basic {encoded}"))),
            None
        );
        assert_eq!(basic_credentials(&headers_with("Basic !!!")), None);
        assert_eq!(basic_credentials(&HeaderMap::new()), None);
    }
}

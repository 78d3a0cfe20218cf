//! Client authentication matrix over the full router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gogemini::store::NewClientKey;

async fn upstream_ok() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/openai/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    server
}

fn request_with_headers(headers: &[(&str, String)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/openai/v1/chat/completions")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    builder.body(Body::from("{}")).unwrap()
}

#[tokio::test]
async fn test_missing_credentials_rejected_with_401() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw.router.oneshot(request_with_headers(&[])).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_bearer_token_rejected_with_401() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw
        .router
        .oneshot(request_with_headers(&[(
            "authorization",
            "Bearer who-dis".into(),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_goog_api_key_rejected_with_401() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw
        .router
        .oneshot(request_with_headers(&[("x-goog-api-key", "who-dis".into())]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_inactive_key_rejected_with_403() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let mut key = gw.store.find_client_key(common::CLIENT_KEY).await.unwrap();
    key.status = "inactive".into();
    gw.store.update_client_key(&key).await.unwrap();

    let resp = gw
        .router
        .oneshot(request_with_headers(&[(
            "authorization",
            format!("Bearer {}", common::CLIENT_KEY),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_expired_key_rejected_with_403_even_if_active() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    gw.store
        .create_client_key(&NewClientKey {
            secret: "expired-key".into(),
            permissions: String::new(),
            rate_limit: 0,
            expires_at: Some(Utc::now() - Duration::hours(1)),
        })
        .await
        .unwrap();

    let resp = gw
        .router
        .oneshot(request_with_headers(&[(
            "authorization",
            "Bearer expired-key".into(),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_valid_bearer_key_passes_through() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw
        .router
        .oneshot(request_with_headers(&[(
            "authorization",
            format!("Bearer {}", common::CLIENT_KEY),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_valid_goog_api_key_passes_through() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw
        .router
        .oneshot(request_with_headers(&[(
            "x-goog-api-key",
            common::CLIENT_KEY.into(),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_successful_auth_increments_usage() {
    let server = upstream_ok().await;
    let gw = common::gateway_with(&server.uri(), &[("k1", 0)]).await;

    let resp = gw
        .router
        .clone()
        .oneshot(request_with_headers(&[(
            "authorization",
            format!("Bearer {}", common::CLIENT_KEY),
        )]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The increment is spawned off the request path; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let key = gw.store.find_client_key(common::CLIENT_KEY).await.unwrap();
    assert_eq!(key.usage_count, 1);
}

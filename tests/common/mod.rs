//! Shared setup for integration tests: an in-memory store, a pool pointed
//! at a mock upstream, and the full router as served in production.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use base64::Engine;

use gogemini::config::Config;
use gogemini::pool::{KeyPool, Manager, PoolOptions};
use gogemini::proxy::gemini::GeminiProxy;
use gogemini::proxy::openai::OpenAiProxy;
use gogemini::server::{build_router, AppState};
use gogemini::store::{NewClientKey, Store};

pub const ADMIN_PASSWORD: &str = "test-password";
pub const CLIENT_KEY: &str = "client-key-1";

pub struct TestGateway {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Store,
}

pub fn test_config() -> Config {
    serde_yaml::from_str(&format!(
        r#"
port: 0
database:
  type: sqlite
  dsn: ":memory:"
admin:
  password: {ADMIN_PASSWORD}
proxy:
  disable_key_threshold: 3
scheduler:
  key_revival_interval: 10m
"#
    ))
    .unwrap()
}

/// Build a gateway whose upstream and probe traffic both go to `upstream`.
/// Seeds the given Gemini keys (secret, initial usage) and one active
/// client key before the pool loads.
pub async fn gateway_with(upstream: &str, gemini_keys: &[(&str, i64)]) -> TestGateway {
    let config = test_config();
    let store = Store::connect(&config.database).await.unwrap();

    for (secret, usage) in gemini_keys {
        let mut key = store.create_gemini_key(secret).await.unwrap();
        if *usage > 0 {
            key.usage_count = *usage;
            store.update_gemini_key(&key).await.unwrap();
        }
    }
    store
        .create_client_key(&NewClientKey {
            secret: CLIENT_KEY.into(),
            permissions: String::new(),
            rate_limit: 0,
            expires_at: None,
        })
        .await
        .unwrap();

    let pool = KeyPool::with_options(
        store.clone(),
        &config,
        PoolOptions {
            probe_base_url: upstream.to_string(),
            revival_cooldown: Duration::from_millis(0),
            sync_db_updates: true,
        },
    )
    .await
    .unwrap();

    let manager: Arc<dyn Manager> = pool.clone();
    let state = Arc::new(AppState {
        gemini_proxy: GeminiProxy::with_base_url(manager.clone(), upstream),
        openai_proxy: OpenAiProxy::with_base_url(manager, upstream),
        db: store.clone(),
        pool,
        config,
    });

    TestGateway {
        router: build_router(state.clone()),
        state,
        store,
    }
}

pub fn client_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {CLIENT_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn admin_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    let credentials =
        base64::engine::general_purpose::STANDARD.encode(format!("admin:{ADMIN_PASSWORD}"));
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Basic {credentials}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub async fn body_json(body: Body) -> serde_json::Value {
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

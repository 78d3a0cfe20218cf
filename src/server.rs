//! Application state, router assembly and the server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api;
use crate::config::Config;
use crate::jobs::Scheduler;
use crate::middleware::auth::client_auth;
use crate::pool::{KeyPool, Manager};
use crate::proxy::gemini::GeminiProxy;
use crate::proxy::openai::OpenAiProxy;
use crate::store::Store;
use crate::webui;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub db: Store,
    pub pool: Arc<KeyPool>,
    pub gemini_proxy: GeminiProxy,
    pub openai_proxy: OpenAiProxy,
    pub config: Config,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Proxy routes sit behind client-key auth; everything else does not.
    let proxied = Router::new()
        .route("/gemini", any(gemini_handler))
        .route("/gemini/*path", any(gemini_handler))
        .route("/openai", any(openai_handler))
        .route("/openai/*path", any(openai_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            client_auth,
        ));

    Router::new()
        .merge(proxied)
        .nest("/admin", api::admin_router(state.clone()))
        .route("/", get(webui::index))
        .route("/vite.svg", get(webui::vite_svg))
        .route("/assets/*path", get(webui::asset))
        .fallback(fallback)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn gemini_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    state.gemini_proxy.handle(req).await
}

async fn openai_handler(
    State(state): State<Arc<AppState>>,
    method: axum::http::Method,
    uri: Uri,
    headers: axum::http::HeaderMap,
    body: bytes::Bytes,
) -> Response {
    state.openai_proxy.handle(method, uri, headers, body).await
}

/// API-shaped paths get a JSON 404; anything else falls through to the
/// single-page admin shell so client-side routing works.
async fn fallback(uri: Uri) -> Response {
    let path = uri.path();
    if path.starts_with("/api") || path.starts_with("/gemini") || path.starts_with("/openai") {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "PAGE_NOT_FOUND", "message": "Page not found"})),
        )
            .into_response()
    } else {
        webui::index().await.into_response()
    }
}

/// Middleware: injects a unique X-Request-Id into every response so clients
/// can correlate errors with gateway logs.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(value) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// Wire everything up and serve until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!("Connecting to database...");
    let db = Store::connect(&config.database).await?;

    info!("Initializing key pool...");
    let pool = KeyPool::new(db.clone(), &config).await?;

    let scheduler = Scheduler::start(pool.clone(), db.clone(), &config);
    info!("Scheduler started");

    let manager: Arc<dyn Manager> = pool.clone();
    let state = Arc::new(AppState {
        gemini_proxy: GeminiProxy::new(manager.clone()),
        openai_proxy: OpenAiProxy::new(manager),
        db,
        pool: pool.clone(),
        config: config.clone(),
    });

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down server...");
    // Stop producing new background work before draining the pool's
    // persistence queue.
    scheduler.stop().await;
    tokio::time::timeout(Duration::from_secs(5), pool.close())
        .await
        .unwrap_or_else(|_| error!("Timed out draining the key pool"));

    info!("Server exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

//! Admin CRUD surface for pooled Gemini keys and client keys.
//!
//! Mounted under `/admin` behind HTTP Basic auth. The caller mounts this
//! router; all routes here are relative.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::middleware::admin::admin_auth;
use crate::server::AppState;

pub mod handlers;

pub fn admin_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/gemini-keys",
            get(handlers::list_gemini_keys).post(handlers::create_gemini_key),
        )
        .route(
            "/gemini-keys/batch",
            post(handlers::batch_create_gemini_keys).delete(handlers::batch_delete_gemini_keys),
        )
        .route("/gemini-keys/test", post(handlers::test_all_gemini_keys))
        .route(
            "/gemini-keys/:id",
            get(handlers::get_gemini_key)
                .put(handlers::update_gemini_key)
                .delete(handlers::delete_gemini_key),
        )
        .route("/gemini-keys/:id/test", post(handlers::test_gemini_key))
        .route(
            "/client-keys",
            get(handlers::list_client_keys).post(handlers::create_client_key),
        )
        .route(
            "/client-keys/:id",
            get(handlers::get_client_key)
                .put(handlers::update_client_key)
                .delete(handlers::delete_client_key),
        )
        .route(
            "/client-keys/:id/reset",
            post(handlers::reset_client_key_usage),
        )
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

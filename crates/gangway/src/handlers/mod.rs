pub mod auth;
pub mod storage;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};

use crate::blob_store::BlobStore;
use crate::config::Config;
use crate::db::GatewayRepo;
use crate::progress::ProgressHub;
use crate::rate_limit::RateLimiter;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub repo: GatewayRepo,
    pub store: Arc<dyn BlobStore>,
    pub hub: Arc<ProgressHub>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Build the API router: session endpoints, storage endpoints, and the
/// progress WebSocket.
pub fn router(state: ApiState) -> Router {
    let body_limit = state.config.max_upload_bytes as usize;
    Router::new()
        .route("/api/login", post(auth::login))
        .route("/api/logout", post(auth::logout))
        .route("/api/session", get(auth::session))
        .route(
            "/storage/namespaces",
            get(storage::list_namespaces)
                .post(storage::create_namespace)
                .patch(storage::update_namespace)
                .delete(storage::delete_namespace),
        )
        .route("/storage/files", get(storage::list_files))
        .route("/storage/upload", post(storage::upload))
        .route("/storage/download", get(storage::download))
        .route("/storage/delete", delete(storage::delete_file))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

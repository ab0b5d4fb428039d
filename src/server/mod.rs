//! HTTP surface of the proxy.

mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

use crate::debug::DebugRecorder;
use crate::proxy::{Forwarder, HealthTracker, Router};
use crate::store::Registry;

/// Multipart bodies above this are rejected before parsing.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub health: Arc<HealthTracker>,
    pub router: Arc<Router>,
    pub forwarder: Arc<Forwarder>,
    pub recorder: Arc<DebugRecorder>,
    pub probe_client: reqwest::Client,
}

impl AppState {
    /// Wires the full component graph around a registry. The debug
    /// recorder doubles as the forwarder's observer.
    pub fn new(registry: Arc<Registry>) -> Self {
        let health = Arc::new(HealthTracker::new());
        let router = Arc::new(Router::new(Arc::clone(&registry), Arc::clone(&health)));
        let recorder = Arc::new(DebugRecorder::new());
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&health),
            Arc::clone(&recorder) as Arc<dyn crate::proxy::ForwardObserver>,
        ));
        Self {
            registry,
            health,
            router,
            forwarder,
            recorder,
            probe_client: reqwest::Client::new(),
        }
    }
}

/// Builds the axum router with all routes.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ping", get(handlers::ping))
        .route("/predict", post(handlers::predict))
        .route("/api/health", get(handlers::health))
        .route(
            "/api/config",
            get(handlers::config_get).post(handlers::config_set),
        )
        .route("/api/debug/status", get(handlers::debug_status))
        .route("/api/debug/toggle", post(handlers::debug_toggle))
        .route("/api/debug/max-records", post(handlers::debug_max_records))
        .route(
            "/api/debug/records",
            get(handlers::debug_records).delete(handlers::debug_clear),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

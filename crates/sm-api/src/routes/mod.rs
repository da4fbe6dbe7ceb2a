pub mod servers;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::request_id::propagate_request_id;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/server", post(servers::provision_server))
        .route("/servers", get(servers::list_servers))
        .route("/servers/{id}", get(servers::get_server))
        .route("/servers/{id}/action", post(servers::server_action))
        .route("/servers/{id}/logs", get(servers::server_logs))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn(propagate_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ready"
}

pub async fn metrics_text() -> String {
    metrics::render()
}

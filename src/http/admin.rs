//! Balancer routes: health, backend administration and the proxied `/ws`

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::BalancerState;
use crate::balancer::pool::{BackendStatus, PoolError};
use crate::balancer::proxy::ws_proxy_handler;
use crate::util::time::uptime_secs;

use super::routes::AppError;

/// Build the balancer router
pub fn build_balancer_router(state: BalancerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/backends",
            get(list_backends).post(add_backend).delete(remove_backend),
        )
        .route("/ws", get(ws_proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    backends: usize,
    active_connections: usize,
}

async fn health_handler(State(state): State<BalancerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        backends: state.pool.len(),
        active_connections: state.pool.total_active(),
    })
}

async fn list_backends(State(state): State<BalancerState>) -> Json<Vec<BackendStatus>> {
    Json(state.pool.status())
}

#[derive(Deserialize)]
struct BackendRequest {
    url: String,
}

#[derive(Serialize)]
struct BackendAdded {
    id: u64,
    url: String,
}

async fn add_backend(
    State(state): State<BalancerState>,
    Json(req): Json<BackendRequest>,
) -> Result<(StatusCode, Json<BackendAdded>), AppError> {
    let url = req.url.trim().to_string();
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(AppError::BadRequest(format!(
            "Backend URL must start with ws:// or wss://, got {url:?}"
        )));
    }

    let id = state.pool.add_backend(url.clone()).map_err(|e| match e {
        PoolError::DuplicateBackend(_) => AppError::Conflict(e.to_string()),
        other => AppError::Internal(other.to_string()),
    })?;
    info!(backend = %url, "Backend registered over HTTP");

    Ok((StatusCode::CREATED, Json(BackendAdded { id, url })))
}

async fn remove_backend(
    State(state): State<BalancerState>,
    Json(req): Json<BackendRequest>,
) -> Result<StatusCode, AppError> {
    if state.pool.remove_backend(req.url.trim()) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Unknown backend {}", req.url)))
    }
}

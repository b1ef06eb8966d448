use crate::stats::Stats;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::info;

// ─────────────────────────────────────────────────────────────────────
//  Handlers
// ─────────────────────────────────────────────────────────────────────

/// `GET /health` — simple health check.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /stats` — current `Stats` counters, snapshotted since the last
/// poll of this endpoint (not since the background reporter last ran).
async fn get_stats(State(state): State<ApiState>) -> impl IntoResponse {
    let mut last_poll = state.last_poll.lock().await;
    let now = Instant::now();
    let elapsed = now - *last_poll;
    *last_poll = now;
    Json(state.stats.snapshot_and_reset(elapsed.max(Duration::from_millis(1))))
}

// ─────────────────────────────────────────────────────────────────────
//  Server bootstrap
// ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ApiState {
    stats: Arc<Stats>,
    last_poll: Arc<tokio::sync::Mutex<Instant>>,
}

/// Build the axum Router with the read-only introspection routes.
pub fn build_router(stats: Arc<Stats>) -> Router {
    let state = ApiState {
        stats,
        last_poll: Arc::new(tokio::sync::Mutex::new(Instant::now())),
    };
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .with_state(state)
}

/// Start the REST API server. Returns the `JoinHandle` so the caller can
/// join on it alongside the engine's other tasks.
pub async fn start_api_server(
    host: &str,
    port: u16,
    stats: Arc<Stats>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let app = build_router(stats);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "REST API listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "REST API server error");
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let body = health().await.into_response();
        assert_eq!(body.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_endpoint_snapshots_counters() {
        let stats = Stats::new();
        stats.record_mqtt_publish();
        let state = ApiState {
            stats: Arc::clone(&stats),
            last_poll: Arc::new(tokio::sync::Mutex::new(Instant::now() - Duration::from_secs(1))),
        };
        let response = get_stats(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn router_builds_with_both_routes() {
        let _router = build_router(Stats::new());
    }
}

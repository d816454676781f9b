//! Unauthenticated operational endpoints: Prometheus scrape and a health
//! check that actually touches the store.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use bourracho_gateway::Metrics;
use bourracho_sync::Engine;

#[derive(Clone)]
struct MonitoringState {
    engine: Arc<Engine>,
    metrics: Arc<Metrics>,
    started: Instant,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    store: &'static str,
    uptime_secs: u64,
    active_conversations: usize,
    subscribers: usize,
}

pub fn router(engine: Arc<Engine>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics_text))
        .with_state(MonitoringState {
            engine,
            metrics,
            started: Instant::now(),
        })
}

/// 200 when the store answers, 503 otherwise.
async fn health_detailed(State(state): State<MonitoringState>) -> impl IntoResponse {
    let store = match state.engine.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!("Health check: store unreachable: {}", e);
            "error"
        }
    };
    let dispatcher = state.engine.dispatcher();
    let report = HealthReport {
        status: if store == "ok" { "ok" } else { "degraded" },
        store,
        uptime_secs: state.started.elapsed().as_secs(),
        active_conversations: dispatcher.active_conversations(),
        subscribers: dispatcher.total_subscribers(),
    };
    let status = if store == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics_text(State(state): State<MonitoringState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

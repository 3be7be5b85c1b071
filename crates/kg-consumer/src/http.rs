//! `/health`, `/ready`, `/metrics` HTTP surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use kg_net::BreakerState;
use kg_orchestrator::Orchestrator;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::metrics::{breaker_state_label, ConsumerMetrics};

/// Worker-pool connectivity flag flipped once after startup and flipped
/// back during drain. One ingredient of `/ready`; downstream health and
/// circuit-breaker state are read live from the orchestrator instead.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Start not-ready; callers flip this once workers are running.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Mark the process ready to receive traffic.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Mark the process draining; `/ready` starts failing.
    pub fn set_draining(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<ConsumerMetrics>,
    readiness: Readiness,
    orchestrator: Arc<Orchestrator>,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// True iff the worker pool is connected, the intelligence service answers
/// its health check, and its circuit breaker is closed.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let breaker_state = state.orchestrator.circuit_breaker_state();
    let breaker_closed = breaker_state == BreakerState::Closed;
    let intelligence_healthy = state.orchestrator.intelligence_healthy().await;
    if state.readiness.is_ready() && intelligence_healthy && breaker_closed {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "consumer_connected": state.readiness.is_ready(),
                "intelligence_healthy": intelligence_healthy,
                "circuit_breaker": breaker_state_label(breaker_state),
            })),
        )
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot(state.orchestrator.circuit_breaker_state()))
}

/// Build the router serving `/health`, `/ready`, `/metrics`.
pub fn create_app(metrics_handle: Arc<ConsumerMetrics>, readiness: Readiness, orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState {
        metrics: metrics_handle,
        readiness,
        orchestrator,
    };
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

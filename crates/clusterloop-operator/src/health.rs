//! Health, readiness and metrics endpoints
//!
//! Served on two listeners: `/healthz` and `/readyz` on the health address,
//! `/metrics` on the metrics address.

use crate::observability::MetricsState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// State shared by the health handlers.
#[derive(Clone, Default)]
pub struct HealthState {
    /// Set once the controllers are running.
    pub readiness: Arc<AtomicBool>,
    pub metrics: Option<MetricsState>,
}

impl HealthState {
    pub fn new(metrics: Option<MetricsState>) -> Self {
        Self {
            readiness: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.readiness.store(ready, Ordering::Release);
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .with_state(state)
}

pub fn metrics_router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Liveness check. The process answering is the whole check.
async fn health_check() -> &'static str {
    "OK"
}

#[tracing::instrument(skip(state))]
async fn readiness_check(State(state): State<HealthState>) -> Result<&'static str, StatusCode> {
    if state.readiness.load(Ordering::Acquire) {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn get_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            metrics.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Serve `router` on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

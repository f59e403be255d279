//! Probe and metrics endpoints for the process embedding the scheduler

use crate::config::ScanConfig;
use crate::health::HealthRegistry;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    /// Registry the scan metrics were registered on
    pub registry: Registry,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, registry: Registry) -> Self {
        Self {
            health_registry,
            registry,
        }
    }
}

/// JSON probe body, 503 when the probe fails
fn probe<T: Serialize>(passing: bool, body: T) -> Response {
    let status = if passing {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Liveness: degraded components still pass
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    probe(health.status.is_operational(), health)
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    probe(readiness.ready, readiness)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode scan metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probes on the configured port until the listener fails
pub async fn serve(config: &ScanConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.api_addr()).await?;
    serve_on(listener, state).await
}

/// Serve the probes on an already bound listener
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Serving health and metrics endpoints");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

//! Admin HTTP Endpoints
//!
//! Optional listener for operators:
//! - GET /health  - liveness with uptime, active requests and listener count
//! - GET /metrics - Prometheus text exposition
//!
//! Not part of the client protocol and carries no authentication; bind it to
//! a private interface.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ServerError, ServerResult};
use crate::state::ServerState;
use crate::telemetry::metrics_handler;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_requests: u64,
    pub listeners: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
}

/// GET /health
pub async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
        active_requests: state.stats.snapshot().concurrency,
        listeners: state.listeners.listener_count(),
    };
    (StatusCode::OK, Json(response))
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the admin router on `addr` until the task is dropped.
pub async fn serve_admin(addr: SocketAddr, state: Arc<ServerState>) -> ServerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::internal(format!("Failed to bind admin listener {}: {}", addr, e)))?;
    tracing::info!(%addr, "Admin HTTP listener started");
    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| ServerError::internal(format!("Admin server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() -> Result<(), serde_json::Error> {
        let response = HealthResponse {
            status: HealthStatus::Healthy,
            version: "0.1.0".to_string(),
            uptime_seconds: 12,
            active_requests: 0,
            listeners: 3,
        };
        let json = serde_json::to_value(&response)?;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["listeners"], 3);
        Ok(())
    }
}

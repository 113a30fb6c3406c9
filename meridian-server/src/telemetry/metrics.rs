//! Prometheus Metrics Definitions
//!
//! Defines all Meridian metrics with appropriate labels and types.
//! Exposed on the admin listener's /metrics endpoint.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use crate::error::{ServerError, ServerResult};

/// Request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ServerResult<MeridianMetrics>> = Lazy::new(MeridianMetrics::new);

/// Run `f` against the global metrics if they initialized.
pub fn with_metrics(f: impl FnOnce(&MeridianMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Container for all Meridian metrics.
#[derive(Clone)]
pub struct MeridianMetrics {
    /// Request counter - labels: command, outcome
    pub requests_total: CounterVec,

    /// Request duration histogram - labels: command
    pub request_duration_seconds: HistogramVec,

    /// Requests currently executing
    pub active_requests: Gauge,

    /// Sessions currently long-polling for invalidations
    pub listeners: Gauge,

    /// Open client connections
    pub connections: Gauge,

    /// Invalidation batches delivered to listener mailboxes - labels: table
    pub invalidation_deliveries_total: CounterVec,

    /// Commit failures - labels: store
    pub commit_failures_total: CounterVec,

    /// Handshake outcomes - labels: outcome
    pub handshakes_total: CounterVec,
}

impl MeridianMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ServerResult<Self> {
        Ok(Self {
            requests_total: register_counter_vec!(
                "meridian_requests_total",
                "Total number of dispatched requests",
                &["command", "outcome"]
            )
            .map_err(|e| ServerError::internal(format!("Failed to register requests_total: {}", e)))?,

            request_duration_seconds: register_histogram_vec!(
                "meridian_request_duration_seconds",
                "Request duration in seconds",
                &["command"],
                REQUEST_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ServerError::internal(format!("Failed to register request_duration_seconds: {}", e)))?,

            active_requests: register_gauge!(
                "meridian_active_requests",
                "Requests currently executing"
            )
            .map_err(|e| ServerError::internal(format!("Failed to register active_requests: {}", e)))?,

            listeners: register_gauge!(
                "meridian_cache_listeners",
                "Sessions waiting for cache invalidations"
            )
            .map_err(|e| ServerError::internal(format!("Failed to register cache_listeners: {}", e)))?,

            connections: register_gauge!(
                "meridian_connections",
                "Open client connections"
            )
            .map_err(|e| ServerError::internal(format!("Failed to register connections: {}", e)))?,

            invalidation_deliveries_total: register_counter_vec!(
                "meridian_invalidation_deliveries_total",
                "Invalidated tables delivered to listeners",
                &["table"]
            )
            .map_err(|e| ServerError::internal(format!("Failed to register invalidation_deliveries_total: {}", e)))?,

            commit_failures_total: register_counter_vec!(
                "meridian_commit_failures_total",
                "Datastore commit failures",
                &["store"]
            )
            .map_err(|e| ServerError::internal(format!("Failed to register commit_failures_total: {}", e)))?,

            handshakes_total: register_counter_vec!(
                "meridian_handshakes_total",
                "Handshake attempts",
                &["outcome"]
            )
            .map_err(|e| ServerError::internal(format!("Failed to register handshakes_total: {}", e)))?,
        })
    }

    /// Record a completed request.
    pub fn record_request(&self, command: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "fault" };
        self.requests_total
            .with_label_values(&[command, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[command])
            .observe(duration_secs);
    }

    pub fn record_delivery(&self, table: &str) {
        self.invalidation_deliveries_total
            .with_label_values(&[table])
            .inc();
    }

    pub fn record_commit_failure(&self, store: &str) {
        self.commit_failures_total.with_label_values(&[store]).inc();
    }

    pub fn record_handshake(&self, outcome: &str) {
        self.handshakes_total.with_label_values(&[outcome]).inc();
    }
}

/// Handler for GET /metrics.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_record_request() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_request("add", true, 0.015);
        metrics.record_commit_failure("secondary");
        let count = metrics
            .requests_total
            .with_label_values(&["add", "success"])
            .get();
        assert!(count >= 1.0);
        Ok(())
    }
}

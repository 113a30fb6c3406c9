//! Meridian Telemetry - Logging and Metrics
//!
//! Structured logging through `tracing` and Prometheus metrics exposed by the
//! admin HTTP listener.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{metrics_handler, MeridianMetrics, METRICS};

//! Observability infrastructure for the Rampart control plane.
//!
//! This crate provides:
//! - Structured JSON logging with standard release event names
//! - Prometheus metrics for releases, rollouts and registry syncs
//!
//! # Usage
//!
//! ```ignore
//! use rampart_telemetry::{Telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new().with_log_level("info");
//! let telemetry = Telemetry::init(config)?;
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::MetricsRegistry;
pub use prometheus::PROMETHEUS_CONTENT_TYPE;

use std::sync::Arc;
use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Main telemetry handle.
///
/// Holds the metrics registry shared by the orchestrator, the dispatcher
/// and the `/metrics` endpoint.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Initialize logging and the metrics registry.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::init_without_logging(config))
    }

    /// Initialize telemetry without setting up logging.
    ///
    /// Use this when logging is already initialized (e.g., in tests).
    pub fn init_without_logging(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Get the telemetry configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Get a cloned Arc reference to the metrics registry.
    pub fn metrics_clone(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Render metrics in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        prometheus::render_metrics(&self.metrics)
    }
}

//! Structured logging with JSON output.
//!
//! Implements 12-factor app logging: structured JSON to stdout.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // Build the env filter from config or RUST_LOG
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

/// Initialize JSON logging for production.
fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Initialize pretty logging for development.
fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names for the release pipeline.
pub mod events {
    /// Control plane is starting up.
    pub const STARTUP: &str = "startup";

    /// Control plane is listening on a port.
    pub const LISTENING: &str = "listening";

    /// A release attempt passed validation and was committed.
    pub const RELEASE_VALIDATED: &str = "release_validated";

    /// A release attempt was rejected before any rollout started.
    pub const RELEASE_REJECTED: &str = "release_rejected";

    /// A rollout job for one data plane entered `doing`.
    pub const ROLLOUT_STARTED: &str = "rollout_started";

    /// A rollout job for one data plane finished successfully.
    pub const ROLLOUT_SUCCEEDED: &str = "rollout_succeeded";

    /// A rollout job for one data plane finished with a failure.
    pub const ROLLOUT_FAILED: &str = "rollout_failed";

    /// A registry prefix was replaced with a new generation.
    pub const REGISTRY_SYNCED: &str = "registry_synced";

    /// A binding plan was committed.
    pub const BINDINGS_APPLIED: &str = "bindings_applied";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_release_validated {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::RELEASE_VALIDATED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_release_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::RELEASE_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_rollout_started {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::ROLLOUT_STARTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_rollout_succeeded {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::ROLLOUT_SUCCEEDED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_rollout_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::ROLLOUT_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_registry_synced {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::REGISTRY_SYNCED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_bindings_applied {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::BINDINGS_APPLIED,
            $($field)*
        )
    };
}

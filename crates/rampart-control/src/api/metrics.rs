//! Prometheus scrape endpoint.

use axum::{extract::State, http::header, response::IntoResponse};
use rampart_telemetry::{prometheus::render_metrics, PROMETHEUS_CONTENT_TYPE};

use super::router::AppState;

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        render_metrics(&state.metrics),
    )
}

//! Axum router configuration.

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use rampart_telemetry::MetricsRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use super::{bindings, health, metrics, releases};
use crate::binding::BindingPlanner;
use crate::db::ReleaseStore;
use crate::release::ReleaseOrchestrator;

/// API version header value.
const API_VERSION: &str = "application/vnd.rampart.v1+json";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ReleaseOrchestrator>,
    pub planner: Arc<BindingPlanner>,
    pub store: Arc<dyn ReleaseStore>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics))
        // Releases
        .route(
            "/gateways/{gateway_id}/stages/{stage_id}/releases",
            post(releases::create_release),
        )
        .route(
            "/gateways/{gateway_id}/stages/{stage_id}/revoke",
            post(releases::revoke_stage),
        )
        .route(
            "/gateways/{gateway_id}/stages/{stage_id}/release",
            get(releases::get_release),
        )
        .route("/gateways/{gateway_id}/triggers", post(releases::trigger))
        .route(
            "/gateways/{gateway_id}/release-histories",
            get(releases::list_histories),
        )
        .route("/release-histories/{id}", get(releases::get_history))
        .route(
            "/release-attempts/{id}/histories",
            get(releases::attempt_histories),
        )
        // Bindings
        .route(
            "/gateways/{gateway_id}/plugin-bindings",
            post(bindings::bind_plugin),
        )
        .route(
            "/gateways/{gateway_id}/access-strategy-bindings",
            post(bindings::bind_access_strategy),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // API versioning: set Content-Type to versioned media type for JSON responses
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(API_VERSION),
        ))
        .with_state(state)
}

//! Plugin and access-strategy binding endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::router::AppState;
use crate::binding::{BindOutcome, BindRequest, SourceKind};
use crate::error::ProblemDetails;

#[derive(Debug, Default, Deserialize)]
pub struct BindQuery {
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /gateways/{gateway_id}/plugin-bindings - Bind a plugin config to scopes.
pub async fn bind_plugin(
    State(state): State<AppState>,
    Path(gateway_id): Path<Uuid>,
    Query(query): Query<BindQuery>,
    Json(request): Json<BindRequest>,
) -> Result<Json<BindOutcome>, ProblemDetails> {
    let outcome = state
        .planner
        .bind(gateway_id, SourceKind::PluginConfig, request, query.dry_run)
        .await?;
    Ok(Json(outcome))
}

/// POST /gateways/{gateway_id}/access-strategy-bindings - Bind an access strategy to scopes.
pub async fn bind_access_strategy(
    State(state): State<AppState>,
    Path(gateway_id): Path<Uuid>,
    Query(query): Query<BindQuery>,
    Json(request): Json<BindRequest>,
) -> Result<Json<BindOutcome>, ProblemDetails> {
    let outcome = state
        .planner
        .bind(gateway_id, SourceKind::AccessStrategy, request, query.dry_run)
        .await?;
    Ok(Json(outcome))
}

//! Release, revoke and trigger endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::router::AppState;
use crate::db::{Release, ReleaseHistory};
use crate::error::ProblemDetails;
use crate::release::{
    ReleaseRequest, ReleaseTicket, RevokeRequest, TriggerOutcome, TriggerRequest, TriggerSource,
};

fn default_release_source() -> TriggerSource {
    TriggerSource::VersionPublish
}

fn default_revoke_source() -> TriggerSource {
    TriggerSource::StageDisable
}

#[derive(Debug, Deserialize)]
pub struct CreateReleaseBody {
    pub resource_version_id: Uuid,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default = "default_release_source")]
    pub source: TriggerSource,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default = "default_revoke_source")]
    pub source: TriggerSource,
}

#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    pub stage_id: Option<Uuid>,
    pub source: TriggerSource,
    #[serde(default)]
    pub operator: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub stage_id: Option<Uuid>,
}

/// POST /gateways/{gateway_id}/stages/{stage_id}/releases - Release a resource version.
pub async fn create_release(
    State(state): State<AppState>,
    Path((gateway_id, stage_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<CreateReleaseBody>,
) -> Result<(StatusCode, Json<ReleaseTicket>), ProblemDetails> {
    let ticket = state
        .orchestrator
        .release(ReleaseRequest {
            gateway_id,
            stage_id,
            resource_version_id: body.resource_version_id,
            comment: body.comment,
            operator: body.operator,
            source: body.source,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// POST /gateways/{gateway_id}/stages/{stage_id}/revoke - Withdraw a stage from its data planes.
pub async fn revoke_stage(
    State(state): State<AppState>,
    Path((gateway_id, stage_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<RevokeBody>,
) -> Result<(StatusCode, Json<ReleaseTicket>), ProblemDetails> {
    let ticket = state
        .orchestrator
        .revoke(RevokeRequest {
            gateway_id,
            stage_id,
            comment: body.comment,
            operator: body.operator,
            source: body.source,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// GET /gateways/{gateway_id}/stages/{stage_id}/release - Current release pointer.
pub async fn get_release(
    State(state): State<AppState>,
    Path((gateway_id, stage_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Release>, ProblemDetails> {
    state
        .orchestrator
        .get_release(gateway_id, stage_id)
        .await?
        .map(Json)
        .ok_or_else(|| ProblemDetails::not_found(format!("stage {stage_id} has no release")))
}

/// POST /gateways/{gateway_id}/triggers - Re-release or revoke stages after a change.
pub async fn trigger(
    State(state): State<AppState>,
    Path(gateway_id): Path<Uuid>,
    Json(body): Json<TriggerBody>,
) -> Result<(StatusCode, Json<TriggerOutcome>), ProblemDetails> {
    let outcome = state
        .orchestrator
        .trigger(TriggerRequest {
            gateway_id,
            stage_id: body.stage_id,
            source: body.source,
            operator: body.operator,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// GET /gateways/{gateway_id}/release-histories - Newest first.
pub async fn list_histories(
    State(state): State<AppState>,
    Path(gateway_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ReleaseHistory>>, ProblemDetails> {
    let histories = state
        .orchestrator
        .list_histories(gateway_id, query.stage_id)
        .await?;
    Ok(Json(histories))
}

/// GET /release-histories/{id}
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReleaseHistory>, ProblemDetails> {
    state
        .orchestrator
        .get_history(id)
        .await?
        .map(Json)
        .ok_or_else(|| ProblemDetails::not_found(format!("release history {id} not found")))
}

/// GET /release-attempts/{id}/histories - One history per data plane.
pub async fn attempt_histories(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ReleaseHistory>>, ProblemDetails> {
    Ok(Json(state.orchestrator.attempt_histories(id).await?))
}

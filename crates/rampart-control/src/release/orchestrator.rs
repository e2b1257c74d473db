//! Validates release requests and commits them as outbox jobs.
//!
//! Every call creates one attempt. An attempt writes one history per
//! active data plane of the gateway (or a single history with no data
//! plane when validation fails before any is known). Accepted attempts
//! move the stage's release pointer and enqueue one job per history in
//! the same transaction; the dispatcher completes them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rampart_compiler::{compile_release, CompileOptions, ReleaseMarker};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use super::error::ReleaseError;
use super::input::assemble_input;
use super::policy::{ReleasePolicy, TriggerSource};
use super::reporter::{AttemptContext, ReleaseReporter};
use crate::db::{
    DataPlane, Gateway, HistoryStatus, JobKind, OutboxJob, PointerChange, Release, ReleaseCommit,
    ReleaseHistory, ReleaseStore, Stage, Status,
};

/// Publish a resource version to a stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    pub resource_version_id: Uuid,
    #[serde(default)]
    pub comment: String,
    pub operator: String,
    pub source: TriggerSource,
}

/// Clear a stage from every data plane of the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    #[serde(default)]
    pub comment: String,
    pub operator: String,
    pub source: TriggerSource,
}

/// React to a configuration change on one stage or the whole gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub gateway_id: Uuid,
    pub stage_id: Option<Uuid>,
    pub source: TriggerSource,
    pub operator: String,
}

/// Identifies the histories of an accepted attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseTicket {
    pub attempt_id: Uuid,
    pub release_history_id: Uuid,
    pub release_history_ids: Vec<Uuid>,
}

/// A stage a trigger did not release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedStage {
    pub stage_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerOutcome {
    pub policy: ReleasePolicy,
    pub tickets: Vec<ReleaseTicket>,
    pub skipped: Vec<SkippedStage>,
}

/// Rows a validated release reads.
struct Validated {
    gateway: Gateway,
    stage: Stage,
}

pub struct ReleaseOrchestrator {
    store: Arc<dyn ReleaseStore>,
    reporter: Arc<dyn ReleaseReporter>,
    wake: Arc<Notify>,
    compile_options: CompileOptions,
}

impl ReleaseOrchestrator {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        reporter: Arc<dyn ReleaseReporter>,
        wake: Arc<Notify>,
        compile_options: CompileOptions,
    ) -> Self {
        Self {
            store,
            reporter,
            wake,
            compile_options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReleaseStore> {
        &self.store
    }

    pub async fn release(&self, request: ReleaseRequest) -> Result<ReleaseTicket, ReleaseError> {
        let attempt = AttemptContext {
            attempt_id: Uuid::new_v4(),
            gateway_id: request.gateway_id,
            stage_id: request.stage_id,
            source: request.source,
            operator: request.operator.clone(),
        };
        let data_planes = self.store.active_data_planes(request.gateway_id).await?;

        let validated = match self.validate_release(&request).await {
            Ok(validated) => validated,
            Err(err) if err.is_rejection() => {
                return Err(self
                    .reject(&attempt, Some(request.resource_version_id), &request.comment, &data_planes, err)
                    .await);
            }
            Err(err) => return Err(err),
        };
        if data_planes.is_empty() {
            let err = ReleaseError::NoActiveDataPlane(request.gateway_id);
            return Err(self
                .reject(&attempt, Some(request.resource_version_id), &request.comment, &[], err)
                .await);
        }

        let now = Utc::now();
        let existing = self
            .store
            .get_release(request.gateway_id, request.stage_id)
            .await?;
        let pointer = Release {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |r| r.id),
            gateway_id: request.gateway_id,
            stage_id: request.stage_id,
            resource_version_id: request.resource_version_id,
            comment: request.comment.clone(),
            operator: request.operator.clone(),
            created_at: existing.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
        };

        tracing::debug!(
            gateway = %validated.gateway.name,
            stage = %validated.stage.name,
            data_planes = data_planes.len(),
            "release validated"
        );

        self.commit(
            &attempt,
            PointerChange::Upsert(pointer),
            JobKind::Rollout,
            Some(request.resource_version_id),
            &request.comment,
            &data_planes,
            now,
        )
        .await
    }

    pub async fn revoke(&self, request: RevokeRequest) -> Result<ReleaseTicket, ReleaseError> {
        let attempt = AttemptContext {
            attempt_id: Uuid::new_v4(),
            gateway_id: request.gateway_id,
            stage_id: request.stage_id,
            source: request.source,
            operator: request.operator.clone(),
        };
        let policy = request.source.policy();
        let data_planes = self.store.active_data_planes(request.gateway_id).await?;

        let checked = if policy.is_revoke() {
            self.load_stage(request.gateway_id, request.stage_id)
                .await
                .map(|_| ())
        } else {
            Err(ReleaseError::Validation(format!(
                "trigger source '{}' does not revoke",
                request.source
            )))
        };
        match checked {
            Ok(()) => {}
            Err(err) if err.is_rejection() => {
                return Err(self
                    .reject(&attempt, None, &request.comment, &data_planes, err)
                    .await);
            }
            Err(err) => return Err(err),
        }
        if data_planes.is_empty() {
            let err = ReleaseError::NoActiveDataPlane(request.gateway_id);
            return Err(self.reject(&attempt, None, &request.comment, &[], err).await);
        }

        let pointer = match policy {
            ReleasePolicy::RevokeOnDelete => PointerChange::Remove {
                gateway_id: request.gateway_id,
                stage_id: request.stage_id,
            },
            _ => PointerChange::Keep,
        };
        self.commit(
            &attempt,
            pointer,
            JobKind::Revoke,
            None,
            &request.comment,
            &data_planes,
            Utc::now(),
        )
        .await
    }

    /// Apply the policy of `request.source` to one stage or every stage of the gateway.
    ///
    /// Stages without a release pointer are skipped. Rejected stages are
    /// reported in the outcome; their failure histories are already written.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerOutcome, ReleaseError> {
        let policy = request.source.policy();
        let gateway = self
            .store
            .get_gateway(request.gateway_id)
            .await?
            .ok_or(ReleaseError::not_found("gateway", request.gateway_id))?;
        let stages = match request.stage_id {
            Some(stage_id) => vec![self.load_stage(gateway.id, stage_id).await?],
            None => self.store.list_stages(gateway.id).await?,
        };

        let mut outcome = TriggerOutcome {
            policy,
            tickets: Vec::new(),
            skipped: Vec::new(),
        };
        let gateway_paused = gateway.status == Status::Inactive
            && request.source != TriggerSource::GatewayEnable;

        for stage in stages {
            let skip = |reason: &str| SkippedStage {
                stage_id: stage.id,
                reason: reason.to_string(),
            };
            let Some(pointer) = self.store.get_release(gateway.id, stage.id).await? else {
                outcome.skipped.push(skip("stage has no release"));
                continue;
            };

            let result = match policy {
                ReleasePolicy::RollingUpdate => {
                    if gateway_paused {
                        outcome.skipped.push(skip("gateway is inactive"));
                        continue;
                    }
                    if stage.status == Status::Inactive
                        && request.source != TriggerSource::StageEnable
                    {
                        outcome.skipped.push(skip("stage is inactive"));
                        continue;
                    }
                    self.release(ReleaseRequest {
                        gateway_id: gateway.id,
                        stage_id: stage.id,
                        resource_version_id: pointer.resource_version_id,
                        comment: format!("{} trigger", request.source),
                        operator: request.operator.clone(),
                        source: request.source,
                    })
                    .await
                }
                ReleasePolicy::RevokeOnDisable | ReleasePolicy::RevokeOnDelete => {
                    self.revoke(RevokeRequest {
                        gateway_id: gateway.id,
                        stage_id: stage.id,
                        comment: format!("{} trigger", request.source),
                        operator: request.operator.clone(),
                        source: request.source,
                    })
                    .await
                }
            };

            match result {
                Ok(ticket) => outcome.tickets.push(ticket),
                Err(err) if err.is_rejection() => outcome.skipped.push(skip(&err.to_string())),
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    pub async fn get_release(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
    ) -> Result<Option<Release>, ReleaseError> {
        Ok(self.store.get_release(gateway_id, stage_id).await?)
    }

    pub async fn list_histories(
        &self,
        gateway_id: Uuid,
        stage_id: Option<Uuid>,
    ) -> Result<Vec<ReleaseHistory>, ReleaseError> {
        Ok(self.store.list_histories(gateway_id, stage_id).await?)
    }

    pub async fn attempt_histories(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<ReleaseHistory>, ReleaseError> {
        Ok(self.store.attempt_histories(attempt_id).await?)
    }

    pub async fn get_history(&self, id: Uuid) -> Result<Option<ReleaseHistory>, ReleaseError> {
        Ok(self.store.get_history(id).await?)
    }

    async fn load_stage(&self, gateway_id: Uuid, stage_id: Uuid) -> Result<Stage, ReleaseError> {
        match self.store.get_stage(stage_id).await? {
            Some(stage) if stage.gateway_id == gateway_id => Ok(stage),
            _ => Err(ReleaseError::not_found("stage", stage_id)),
        }
    }

    async fn validate_release(&self, request: &ReleaseRequest) -> Result<Validated, ReleaseError> {
        let gateway = self
            .store
            .get_gateway(request.gateway_id)
            .await?
            .ok_or(ReleaseError::not_found("gateway", request.gateway_id))?;
        if gateway.status == Status::Inactive && request.source != TriggerSource::GatewayEnable {
            return Err(ReleaseError::Validation(format!(
                "gateway '{}' is inactive",
                gateway.name
            )));
        }

        let stage = self.load_stage(gateway.id, request.stage_id).await?;
        if stage.status == Status::Inactive && request.source != TriggerSource::StageEnable {
            return Err(ReleaseError::Validation(format!(
                "stage '{}' is inactive",
                stage.name
            )));
        }

        let version = match self
            .store
            .get_resource_version(request.resource_version_id)
            .await?
        {
            Some(version) if version.gateway_id == gateway.id => version,
            _ => {
                return Err(ReleaseError::not_found(
                    "resource version",
                    request.resource_version_id,
                ))
            }
        };

        // A dry compile catches bad plugin configs before anything is committed.
        let marker = ReleaseMarker {
            publish_id: Uuid::nil(),
            published_at: Utc::now(),
        };
        let input = assemble_input(self.store.as_ref(), &gateway, &stage, &version, marker).await?;
        compile_release(&input, &self.compile_options).map_err(|e| match ReleaseError::from(e) {
            ReleaseError::Compile(e) => ReleaseError::Validation(e.to_string()),
            other => other,
        })?;

        Ok(Validated { gateway, stage })
    }

    /// Record a refused attempt and hand the error back.
    async fn reject(
        &self,
        attempt: &AttemptContext,
        resource_version_id: Option<Uuid>,
        comment: &str,
        data_planes: &[DataPlane],
        err: ReleaseError,
    ) -> ReleaseError {
        let message = err.to_string();
        let now = Utc::now();
        let targets: Vec<Option<Uuid>> = if data_planes.is_empty() {
            vec![None]
        } else {
            data_planes.iter().map(|dp| Some(dp.id)).collect()
        };
        let histories = targets
            .into_iter()
            .map(|data_plane_id| {
                let mut history =
                    new_history(attempt, resource_version_id, data_plane_id, comment, now);
                history.status = HistoryStatus::Failure;
                history.message = message.clone();
                history.finished_at = Some(now);
                history
            })
            .collect();

        if let Err(store_err) = self
            .store
            .commit_release(ReleaseCommit::histories(histories))
            .await
        {
            return store_err.into();
        }
        self.reporter.validate_failure(attempt, &message);
        err
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        attempt: &AttemptContext,
        pointer: PointerChange,
        kind: JobKind,
        resource_version_id: Option<Uuid>,
        comment: &str,
        data_planes: &[DataPlane],
        now: DateTime<Utc>,
    ) -> Result<ReleaseTicket, ReleaseError> {
        let histories: Vec<ReleaseHistory> = data_planes
            .iter()
            .map(|dp| new_history(attempt, resource_version_id, Some(dp.id), comment, now))
            .collect();
        let jobs = histories
            .iter()
            .zip(data_planes)
            .map(|(history, dp)| OutboxJob {
                id: Uuid::new_v4(),
                kind,
                gateway_id: attempt.gateway_id,
                stage_id: attempt.stage_id,
                data_plane_id: dp.id,
                release_history_id: history.id,
                attempt_id: attempt.attempt_id,
                resource_version_id,
                operator: attempt.operator.clone(),
                comment: comment.to_string(),
                attempts: 0,
                run_at: now,
                locked_until: None,
                last_error: None,
                created_at: now,
            })
            .collect();

        self.store
            .commit_release(ReleaseCommit {
                pointer,
                histories: histories.clone(),
                jobs,
            })
            .await?;

        self.reporter.validate_success(attempt);
        for history in &histories {
            self.reporter.task_doing(history);
        }
        self.wake.notify_one();

        let ids: Vec<Uuid> = histories.iter().map(|h| h.id).collect();
        Ok(ReleaseTicket {
            attempt_id: attempt.attempt_id,
            release_history_id: ids.first().copied().unwrap_or_default(),
            release_history_ids: ids,
        })
    }
}

fn new_history(
    attempt: &AttemptContext,
    resource_version_id: Option<Uuid>,
    data_plane_id: Option<Uuid>,
    comment: &str,
    now: DateTime<Utc>,
) -> ReleaseHistory {
    ReleaseHistory {
        id: Uuid::now_v7(),
        attempt_id: attempt.attempt_id,
        gateway_id: attempt.gateway_id,
        stage_id: attempt.stage_id,
        resource_version_id,
        data_plane_id,
        source: attempt.source,
        status: HistoryStatus::Doing,
        operator: attempt.operator.clone(),
        comment: comment.to_string(),
        message: String::new(),
        created_at: now,
        finished_at: None,
    }
}

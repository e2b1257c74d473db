//! Runs outbox jobs against data plane registries.
//!
//! The dispatcher claims due jobs, runs each one as `rollout` followed by
//! `on_rollout_success`, and moves the job's history out of `doing`.
//! Rollouts for the same gateway, stage and data plane are serialized twice:
//! by an in-process keyed lock, and by a store rollout session that also
//! excludes other control plane processes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rampart_compiler::{compile_release, resources_checksum, CompileOptions, ReleaseMarker};
use rampart_registry::{RetryPolicy, SyncSummary};
use rampart_telemetry::MetricsRegistry;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::ReleaseError;
use super::input::assemble_input;
use super::registry_provider::RegistryProvider;
use super::reporter::ReleaseReporter;
use crate::db::{
    DataPlaneReleaseState, HistoryStatus, JobKind, OutboxJob, ReleaseHistory, ReleaseStore,
    StoreError,
};
use crate::keyed_lock::KeyedLocks;

/// Message of a rollout skipped because a later one already reached the data plane.
pub const SUPERSEDED_MESSAGE: &str = "superseded by a newer release";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed job stays invisible to other dispatchers.
    pub lease: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 32,
            lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

type LockKey = (Uuid, Uuid, Uuid);

enum Rollout {
    /// Checksum of the synced objects; `None` for a revoke.
    Applied { checksum: Option<String> },
    Superseded,
}

pub struct Dispatcher {
    store: Arc<dyn ReleaseStore>,
    registries: Arc<dyn RegistryProvider>,
    reporter: Arc<dyn ReleaseReporter>,
    metrics: Arc<MetricsRegistry>,
    wake: Arc<Notify>,
    locks: KeyedLocks<LockKey>,
    compile_options: CompileOptions,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        registries: Arc<dyn RegistryProvider>,
        reporter: Arc<dyn ReleaseReporter>,
        metrics: Arc<MetricsRegistry>,
        wake: Arc<Notify>,
        compile_options: CompileOptions,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registries,
            reporter,
            metrics,
            wake,
            locks: KeyedLocks::default(),
            compile_options,
            config,
        }
    }

    /// Dispatch until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "release dispatcher started"
        );

        loop {
            if let Err(e) = self.dispatch_once().await {
                tracing::error!(error = %e, "failed to claim release jobs");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("release dispatcher stopped");
    }

    /// Claim one batch of due jobs and spawn them.
    pub async fn dispatch_once(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let jobs = self
            .store
            .claim_jobs(self.config.batch_size, self.config.lease)
            .await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.process(job).await })
            })
            .collect())
    }

    /// Run due jobs until none is left. Returns how many ran.
    pub async fn drain(self: &Arc<Self>) -> Result<usize, StoreError> {
        let mut ran = 0;
        loop {
            let handles = self.dispatch_once().await?;
            if handles.is_empty() {
                return Ok(ran);
            }
            ran += handles.len();
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "release job panicked");
                }
            }
        }
    }

    /// Keys with a job running or waiting in this process.
    #[cfg(test)]
    pub(crate) fn held_locks(&self) -> usize {
        self.locks.len()
    }

    async fn process(&self, job: OutboxJob) {
        let _guard = self
            .locks
            .lock((job.gateway_id, job.stage_id, job.data_plane_id))
            .await;

        let started = Instant::now();
        self.metrics.rollout_started();
        let status = match self.run_job(&job).await {
            Ok(status) => status,
            Err(e) => {
                // The lease expires and the job is claimed again.
                tracing::error!(
                    job_id = %job.id,
                    release_history_id = %job.release_history_id,
                    error = %e,
                    "release job interrupted"
                );
                "error"
            }
        };
        if status == "retry" {
            self.metrics.record_rollout_retry();
        } else {
            self.metrics.record_rollout(
                job.kind.as_str(),
                status,
                started.elapsed().as_secs_f64(),
            );
        }
    }

    /// Returns the status label for metrics.
    async fn run_job(&self, job: &OutboxJob) -> Result<&'static str, StoreError> {
        let Some(history) = self.store.get_history(job.release_history_id).await? else {
            self.store.complete_job(job.id).await?;
            return Ok("orphaned");
        };
        if history.status.is_terminal() {
            self.store.complete_job(job.id).await?;
            return Ok(history.status.as_str());
        }

        match self.rollout(job, &history).await {
            Ok(Rollout::Applied { checksum }) => {
                self.on_rollout_success(job, &history, checksum.as_deref())
                    .await?;
                Ok("success")
            }
            Ok(Rollout::Superseded) => {
                self.fail(job, &history, SUPERSEDED_MESSAGE).await?;
                Ok("superseded")
            }
            Err(err) => {
                let failures = job.attempts + 1;
                if err.is_transient() && self.config.retry.can_retry(failures) {
                    let delay = self.config.retry.delay_for(failures);
                    let run_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    tracing::warn!(
                        job_id = %job.id,
                        release_history_id = %history.id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "rollout failed, retrying"
                    );
                    self.store
                        .reschedule_job(job.id, run_at, &err.to_string())
                        .await?;
                    Ok("retry")
                } else {
                    self.fail(job, &history, &err.to_string()).await?;
                    Ok("failure")
                }
            }
        }
    }

    /// Compile and sync one data plane. Never touches the history.
    ///
    /// The supersede check, the registry write and the applied state advance
    /// run inside one rollout session, so an older history cannot overwrite
    /// a newer one on the registry. The session holds a store connection, so
    /// every store read happens before it opens.
    async fn rollout(&self, job: &OutboxJob, history: &ReleaseHistory) -> Result<Rollout, ReleaseError> {
        let data_plane = self
            .store
            .get_data_plane(job.data_plane_id)
            .await?
            .ok_or(ReleaseError::not_found("data plane", job.data_plane_id))?;
        let gateway = self
            .store
            .get_gateway(job.gateway_id)
            .await?
            .ok_or(ReleaseError::not_found("gateway", job.gateway_id))?;
        let stage = self
            .store
            .get_stage(job.stage_id)
            .await?
            .ok_or(ReleaseError::not_found("stage", job.stage_id))?;

        let resources = match (job.kind, job.resource_version_id) {
            (JobKind::Rollout, Some(version_id)) => {
                let version = self
                    .store
                    .get_resource_version(version_id)
                    .await?
                    .ok_or(ReleaseError::not_found("resource version", version_id))?;
                let marker = ReleaseMarker {
                    publish_id: history.id,
                    published_at: history.created_at,
                };
                let input =
                    assemble_input(self.store.as_ref(), &gateway, &stage, &version, marker).await?;
                Some(compile_release(&input, &self.compile_options)?.into_resources()?)
            }
            (JobKind::Rollout, None) => {
                return Err(ReleaseError::Validation(
                    "rollout job has no resource version".into(),
                ))
            }
            (JobKind::Revoke, _) => None,
        };

        let registry = self
            .registries
            .registry(&data_plane, &gateway.name, &stage.name)
            .await?;

        let mut session = self
            .store
            .begin_rollout(job.gateway_id, job.stage_id, job.data_plane_id)
            .await?;
        let applied = session.applied_state().await?;
        if applied.is_some_and(|state| state.release_history_id > history.id) {
            session.commit().await?;
            return Ok(Rollout::Superseded);
        }

        let synced = match &resources {
            Some(resources) => registry.sync_by_prefix(resources).await,
            None => registry
                .delete_by_prefix()
                .await
                .map(|deleted| SyncSummary {
                    upserted: 0,
                    deleted,
                }),
        };
        self.metrics
            .record_registry_sync(registry.backend_name(), synced.is_ok());
        let summary = synced?;
        let checksum = resources.as_deref().map(resources_checksum);

        rampart_telemetry::log_registry_synced!(
            data_plane = %data_plane.name,
            prefix = %registry.scope().prefix(),
            upserted = summary.upserted,
            deleted = summary.deleted,
            checksum = checksum.as_deref().unwrap_or(""),
        );

        session
            .advance(&DataPlaneReleaseState {
                gateway_id: job.gateway_id,
                stage_id: job.stage_id,
                data_plane_id: job.data_plane_id,
                release_history_id: history.id,
                resource_version_id: job.resource_version_id,
                updated_at: Utc::now(),
            })
            .await?;
        session.commit().await?;
        Ok(Rollout::Applied { checksum })
    }

    async fn on_rollout_success(
        &self,
        job: &OutboxJob,
        history: &ReleaseHistory,
        checksum: Option<&str>,
    ) -> Result<(), StoreError> {
        let message = match checksum {
            Some(checksum) => format!("released, checksum {checksum}"),
            None => "revoked".to_string(),
        };
        if self
            .store
            .finish_history(history.id, HistoryStatus::Success, &message, Utc::now())
            .await?
        {
            self.reporter.rollout_succeeded(history);
        }
        self.store.complete_job(job.id).await
    }

    async fn fail(
        &self,
        job: &OutboxJob,
        history: &ReleaseHistory,
        message: &str,
    ) -> Result<(), StoreError> {
        if self
            .store
            .finish_history(history.id, HistoryStatus::Failure, message, Utc::now())
            .await?
        {
            self.reporter.rollout_failed(history, message);
        }
        self.store.complete_job(job.id).await
    }
}

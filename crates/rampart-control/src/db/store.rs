//! The persistence contract of the release pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value is invalid: {0}")]
    Corrupt(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`ReleaseStore::apply_bindings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingWrite {
    Applied,
    /// The scope already holds the same plugin from the other source kind.
    /// Nothing was written.
    Conflict { scope_id: Uuid },
}

/// Exclusive hold on one (gateway, stage, data plane) for a rollout.
///
/// Other sessions for the same key wait until this one is committed or
/// dropped. Dropping without commit discards `advance`.
#[async_trait]
pub trait RolloutSession: Send {
    async fn applied_state(&mut self) -> StoreResult<Option<DataPlaneReleaseState>>;

    /// Record an applied history unless a later one is already recorded.
    async fn advance(&mut self, state: &DataPlaneReleaseState) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Configuration rows, release state and the outbox.
///
/// Every method that writes more than one row runs in a single transaction.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    // Configuration rows

    async fn get_gateway(&self, id: Uuid) -> StoreResult<Option<Gateway>>;

    async fn get_stage(&self, id: Uuid) -> StoreResult<Option<Stage>>;

    async fn list_stages(&self, gateway_id: Uuid) -> StoreResult<Vec<Stage>>;

    async fn get_resource_version(&self, id: Uuid) -> StoreResult<Option<ResourceVersion>>;

    async fn get_data_plane(&self, id: Uuid) -> StoreResult<Option<DataPlane>>;

    /// Active data planes bound to the gateway, ordered by name.
    async fn active_data_planes(&self, gateway_id: Uuid) -> StoreResult<Vec<DataPlane>>;

    async fn get_plugin_config(&self, id: Uuid) -> StoreResult<Option<PluginConfig>>;

    async fn list_plugin_configs(&self, gateway_id: Uuid) -> StoreResult<Vec<PluginConfig>>;

    async fn get_access_strategy(&self, id: Uuid) -> StoreResult<Option<AccessStrategy>>;

    async fn list_access_strategies(&self, gateway_id: Uuid) -> StoreResult<Vec<AccessStrategy>>;

    async fn list_ip_groups(&self, gateway_id: Uuid) -> StoreResult<Vec<IpGroup>>;

    /// Plugin bindings of one scope type, in creation order.
    async fn list_plugin_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<PluginBinding>>;

    /// Access strategy bindings of one scope type, in creation order.
    async fn list_strategy_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<AccessStrategyBinding>>;

    /// Upsert and delete bindings of one source.
    ///
    /// Refuses the whole change when an upserted scope holds a binding from
    /// the other source kind whose type is in `changes.conflicting_codes`.
    async fn apply_bindings(&self, changes: &BindingChanges) -> StoreResult<BindingWrite>;

    // Release state

    async fn get_release(&self, gateway_id: Uuid, stage_id: Uuid) -> StoreResult<Option<Release>>;

    /// Apply a pointer change, insert histories and enqueue jobs.
    async fn commit_release(&self, commit: ReleaseCommit) -> StoreResult<()>;

    async fn get_history(&self, id: Uuid) -> StoreResult<Option<ReleaseHistory>>;

    /// Newest first.
    async fn list_histories(
        &self,
        gateway_id: Uuid,
        stage_id: Option<Uuid>,
    ) -> StoreResult<Vec<ReleaseHistory>>;

    async fn attempt_histories(&self, attempt_id: Uuid) -> StoreResult<Vec<ReleaseHistory>>;

    /// Move a history out of `doing`. Returns false if it was not `doing`.
    async fn finish_history(
        &self,
        id: Uuid,
        status: HistoryStatus,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_applied_state(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Option<DataPlaneReleaseState>>;

    /// Lock one (gateway, stage, data plane) across processes sharing the store.
    async fn begin_rollout(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Box<dyn RolloutSession>>;

    // Outbox

    /// Lease up to `limit` due jobs for `lease`.
    async fn claim_jobs(&self, limit: usize, lease: Duration) -> StoreResult<Vec<OutboxJob>>;

    /// Release the lease and run again at `run_at`.
    async fn reschedule_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    /// Remove a finished job.
    async fn complete_job(&self, id: Uuid) -> StoreResult<()>;

    /// Jobs not yet completed.
    async fn pending_jobs(&self) -> StoreResult<usize>;
}

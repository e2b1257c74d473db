//! In-memory store for tests and single-process deployments.
//!
//! All tables sit behind one mutex, so each trait method is atomic the same
//! way a PostgreSQL transaction is. Rollout sessions hold a per-key async
//! lock in place of the advisory lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::*;
use super::store::{BindingWrite, ReleaseStore, RolloutSession, StoreError, StoreResult};
use crate::binding::BindingSource;
use crate::keyed_lock::{KeyedGuard, KeyedLocks};

type RolloutKey = (Uuid, Uuid, Uuid);

#[derive(Debug, Default)]
struct Tables {
    gateways: BTreeMap<Uuid, Gateway>,
    stages: BTreeMap<Uuid, Stage>,
    resource_versions: BTreeMap<Uuid, ResourceVersion>,
    data_planes: BTreeMap<Uuid, DataPlane>,
    gateway_data_planes: BTreeSet<(Uuid, Uuid)>,
    plugin_configs: BTreeMap<Uuid, PluginConfig>,
    access_strategies: BTreeMap<Uuid, AccessStrategy>,
    ip_groups: BTreeMap<Uuid, IpGroup>,
    plugin_bindings: Vec<PluginBinding>,
    strategy_bindings: Vec<AccessStrategyBinding>,
    releases: BTreeMap<(Uuid, Uuid), Release>,
    histories: BTreeMap<Uuid, ReleaseHistory>,
    applied: BTreeMap<RolloutKey, DataPlaneReleaseState>,
    jobs: BTreeMap<Uuid, OutboxJob>,
}

impl Tables {
    fn advance(&mut self, state: &DataPlaneReleaseState) -> bool {
        let key = (state.gateway_id, state.stage_id, state.data_plane_id);
        if let Some(current) = self.applied.get(&key) {
            if current.release_history_id >= state.release_history_id {
                return false;
            }
        }
        self.applied.insert(key, state.clone());
        true
    }

    /// First upserted scope already holding the same plugin from the other source kind.
    fn binding_conflict(&self, changes: &BindingChanges) -> Option<Uuid> {
        let codes = &changes.conflicting_codes;
        let taken = |scope_id: &Uuid| match changes.source {
            BindingSource::PluginConfig { .. } => self.strategy_bindings.iter().any(|b| {
                b.gateway_id == changes.gateway_id
                    && b.scope_type == changes.scope_type
                    && b.scope_id == *scope_id
                    && codes.iter().any(|code| *code == b.strategy_type)
            }),
            BindingSource::AccessStrategy { .. } => self.plugin_bindings.iter().any(|b| {
                b.gateway_id == changes.gateway_id
                    && b.scope_type == changes.scope_type
                    && b.scope_id == *scope_id
                    && codes.iter().any(|code| *code == b.plugin_type)
            }),
        };
        changes.upsert.iter().copied().find(|id| taken(id))
    }
}

/// A [`ReleaseStore`] held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    rollout_locks: KeyedLocks<RolloutKey>,
}

struct MemoryRolloutSession {
    key: RolloutKey,
    tables: Arc<Mutex<Tables>>,
    _guard: KeyedGuard<RolloutKey>,
}

#[async_trait]
impl RolloutSession for MemoryRolloutSession {
    async fn applied_state(&mut self) -> StoreResult<Option<DataPlaneReleaseState>> {
        Ok(self.tables.lock().applied.get(&self.key).cloned())
    }

    async fn advance(&mut self, state: &DataPlaneReleaseState) -> StoreResult<bool> {
        Ok(self.tables.lock().advance(state))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_gateway(&self, gateway: Gateway) {
        self.tables.lock().gateways.insert(gateway.id, gateway);
    }

    pub fn insert_stage(&self, stage: Stage) {
        self.tables.lock().stages.insert(stage.id, stage);
    }

    pub fn insert_resource_version(&self, version: ResourceVersion) {
        self.tables
            .lock()
            .resource_versions
            .insert(version.id, version);
    }

    pub fn insert_data_plane(&self, data_plane: DataPlane) {
        self.tables
            .lock()
            .data_planes
            .insert(data_plane.id, data_plane);
    }

    pub fn bind_data_plane(&self, gateway_id: Uuid, data_plane_id: Uuid) {
        self.tables
            .lock()
            .gateway_data_planes
            .insert((gateway_id, data_plane_id));
    }

    pub fn insert_plugin_config(&self, config: PluginConfig) {
        self.tables.lock().plugin_configs.insert(config.id, config);
    }

    pub fn insert_access_strategy(&self, strategy: AccessStrategy) {
        self.tables
            .lock()
            .access_strategies
            .insert(strategy.id, strategy);
    }

    pub fn insert_ip_group(&self, group: IpGroup) {
        self.tables.lock().ip_groups.insert(group.id, group);
    }

    pub fn set_gateway_status(&self, id: Uuid, status: Status) {
        if let Some(gateway) = self.tables.lock().gateways.get_mut(&id) {
            gateway.status = status;
        }
    }

    pub fn set_stage_status(&self, id: Uuid, status: Status) {
        if let Some(stage) = self.tables.lock().stages.get_mut(&id) {
            stage.status = status;
        }
    }

    pub fn set_data_plane_status(&self, id: Uuid, status: Status) {
        if let Some(dp) = self.tables.lock().data_planes.get_mut(&id) {
            dp.status = status;
        }
    }

    /// Snapshot of every queued job.
    pub fn jobs(&self) -> Vec<OutboxJob> {
        self.tables.lock().jobs.values().cloned().collect()
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    now + chrono::Duration::milliseconds(millis)
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_gateway(&self, id: Uuid) -> StoreResult<Option<Gateway>> {
        Ok(self.tables.lock().gateways.get(&id).cloned())
    }

    async fn get_stage(&self, id: Uuid) -> StoreResult<Option<Stage>> {
        Ok(self.tables.lock().stages.get(&id).cloned())
    }

    async fn list_stages(&self, gateway_id: Uuid) -> StoreResult<Vec<Stage>> {
        let tables = self.tables.lock();
        let mut stages: Vec<Stage> = tables
            .stages
            .values()
            .filter(|s| s.gateway_id == gateway_id)
            .cloned()
            .collect();
        stages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stages)
    }

    async fn get_resource_version(&self, id: Uuid) -> StoreResult<Option<ResourceVersion>> {
        Ok(self.tables.lock().resource_versions.get(&id).cloned())
    }

    async fn get_data_plane(&self, id: Uuid) -> StoreResult<Option<DataPlane>> {
        Ok(self.tables.lock().data_planes.get(&id).cloned())
    }

    async fn active_data_planes(&self, gateway_id: Uuid) -> StoreResult<Vec<DataPlane>> {
        let tables = self.tables.lock();
        let mut planes: Vec<DataPlane> = tables
            .gateway_data_planes
            .iter()
            .filter(|(gw, _)| *gw == gateway_id)
            .filter_map(|(_, dp)| tables.data_planes.get(dp))
            .filter(|dp| dp.status == Status::Active)
            .cloned()
            .collect();
        planes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(planes)
    }

    async fn get_plugin_config(&self, id: Uuid) -> StoreResult<Option<PluginConfig>> {
        Ok(self.tables.lock().plugin_configs.get(&id).cloned())
    }

    async fn list_plugin_configs(&self, gateway_id: Uuid) -> StoreResult<Vec<PluginConfig>> {
        Ok(self
            .tables
            .lock()
            .plugin_configs
            .values()
            .filter(|c| c.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn get_access_strategy(&self, id: Uuid) -> StoreResult<Option<AccessStrategy>> {
        Ok(self.tables.lock().access_strategies.get(&id).cloned())
    }

    async fn list_access_strategies(&self, gateway_id: Uuid) -> StoreResult<Vec<AccessStrategy>> {
        Ok(self
            .tables
            .lock()
            .access_strategies
            .values()
            .filter(|s| s.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn list_ip_groups(&self, gateway_id: Uuid) -> StoreResult<Vec<IpGroup>> {
        Ok(self
            .tables
            .lock()
            .ip_groups
            .values()
            .filter(|g| g.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn list_plugin_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<PluginBinding>> {
        Ok(self
            .tables
            .lock()
            .plugin_bindings
            .iter()
            .filter(|b| b.gateway_id == gateway_id && b.scope_type == scope_type)
            .cloned()
            .collect())
    }

    async fn list_strategy_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<AccessStrategyBinding>> {
        Ok(self
            .tables
            .lock()
            .strategy_bindings
            .iter()
            .filter(|b| b.gateway_id == gateway_id && b.scope_type == scope_type)
            .cloned()
            .collect())
    }

    async fn apply_bindings(&self, changes: &BindingChanges) -> StoreResult<BindingWrite> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        if let Some(scope_id) = tables.binding_conflict(changes) {
            return Ok(BindingWrite::Conflict { scope_id });
        }
        let scope_type = changes.scope_type;
        match changes.source {
            BindingSource::PluginConfig { id, plugin_type } => {
                let code = plugin_type.code();
                let bindings = &mut tables.plugin_bindings;
                bindings.retain(|b| {
                    !(b.scope_type == scope_type
                        && b.config_id == id
                        && changes.delete.contains(&b.scope_id))
                });
                for scope_id in &changes.upsert {
                    match bindings.iter_mut().find(|b| {
                        b.scope_type == scope_type && b.scope_id == *scope_id && b.plugin_type == code
                    }) {
                        Some(existing) => {
                            existing.config_id = id;
                            existing.updated_at = now;
                        }
                        None => bindings.push(PluginBinding {
                            id: Uuid::new_v4(),
                            gateway_id: changes.gateway_id,
                            scope_type,
                            scope_id: *scope_id,
                            config_id: id,
                            plugin_type: code.to_string(),
                            created_at: now,
                            updated_at: now,
                        }),
                    }
                }
            }
            BindingSource::AccessStrategy { id, strategy_type } => {
                let code = strategy_type.code();
                let bindings = &mut tables.strategy_bindings;
                bindings.retain(|b| {
                    !(b.scope_type == scope_type
                        && b.access_strategy_id == id
                        && changes.delete.contains(&b.scope_id))
                });
                for scope_id in &changes.upsert {
                    match bindings.iter_mut().find(|b| {
                        b.scope_type == scope_type
                            && b.scope_id == *scope_id
                            && b.strategy_type == code
                    }) {
                        Some(existing) => {
                            existing.access_strategy_id = id;
                            existing.updated_at = now;
                        }
                        None => bindings.push(AccessStrategyBinding {
                            id: Uuid::new_v4(),
                            gateway_id: changes.gateway_id,
                            scope_type,
                            scope_id: *scope_id,
                            access_strategy_id: id,
                            strategy_type: code.to_string(),
                            created_at: now,
                            updated_at: now,
                        }),
                    }
                }
            }
        }
        Ok(BindingWrite::Applied)
    }

    async fn get_release(&self, gateway_id: Uuid, stage_id: Uuid) -> StoreResult<Option<Release>> {
        Ok(self
            .tables
            .lock()
            .releases
            .get(&(gateway_id, stage_id))
            .cloned())
    }

    async fn commit_release(&self, commit: ReleaseCommit) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        if let Some(dup) = commit
            .histories
            .iter()
            .find(|h| tables.histories.contains_key(&h.id))
        {
            return Err(StoreError::Constraint(format!(
                "release history {} already exists",
                dup.id
            )));
        }

        match commit.pointer {
            PointerChange::Keep => {}
            PointerChange::Upsert(release) => {
                let key = (release.gateway_id, release.stage_id);
                match tables.releases.get_mut(&key) {
                    Some(existing) => {
                        existing.resource_version_id = release.resource_version_id;
                        existing.comment = release.comment;
                        existing.operator = release.operator;
                        existing.updated_at = release.updated_at;
                    }
                    None => {
                        tables.releases.insert(key, release);
                    }
                }
            }
            PointerChange::Remove {
                gateway_id,
                stage_id,
            } => {
                tables.releases.remove(&(gateway_id, stage_id));
            }
        }
        for history in commit.histories {
            tables.histories.insert(history.id, history);
        }
        for job in commit.jobs {
            tables.jobs.insert(job.id, job);
        }
        Ok(())
    }

    async fn get_history(&self, id: Uuid) -> StoreResult<Option<ReleaseHistory>> {
        Ok(self.tables.lock().histories.get(&id).cloned())
    }

    async fn list_histories(
        &self,
        gateway_id: Uuid,
        stage_id: Option<Uuid>,
    ) -> StoreResult<Vec<ReleaseHistory>> {
        Ok(self
            .tables
            .lock()
            .histories
            .values()
            .rev()
            .filter(|h| h.gateway_id == gateway_id)
            .filter(|h| stage_id.map_or(true, |s| h.stage_id == s))
            .cloned()
            .collect())
    }

    async fn attempt_histories(&self, attempt_id: Uuid) -> StoreResult<Vec<ReleaseHistory>> {
        Ok(self
            .tables
            .lock()
            .histories
            .values()
            .filter(|h| h.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn finish_history(
        &self,
        id: Uuid,
        status: HistoryStatus,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.histories.get_mut(&id) {
            Some(history) if history.status == HistoryStatus::Doing => {
                history.status = status;
                history.message = message.to_string();
                history.finished_at = Some(finished_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_applied_state(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Option<DataPlaneReleaseState>> {
        Ok(self
            .tables
            .lock()
            .applied
            .get(&(gateway_id, stage_id, data_plane_id))
            .cloned())
    }

    async fn begin_rollout(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Box<dyn RolloutSession>> {
        let key = (gateway_id, stage_id, data_plane_id);
        let guard = self.rollout_locks.lock(key).await;
        Ok(Box::new(MemoryRolloutSession {
            key,
            tables: Arc::clone(&self.tables),
            _guard: guard,
        }))
    }

    async fn claim_jobs(&self, limit: usize, lease: Duration) -> StoreResult<Vec<OutboxJob>> {
        let now = Utc::now();
        let deadline = lease_deadline(now, lease);
        let mut tables = self.tables.lock();
        let mut claimed = Vec::new();
        for job in tables.jobs.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let leased = job.locked_until.is_some_and(|until| until > now);
            if job.run_at <= now && !leased {
                job.locked_until = Some(deadline);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        if let Some(job) = self.tables.lock().jobs.get_mut(&id) {
            job.attempts += 1;
            job.run_at = run_at;
            job.locked_until = None;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().jobs.remove(&id);
        Ok(())
    }

    async fn pending_jobs(&self) -> StoreResult<usize> {
        Ok(self.tables.lock().jobs.len())
    }
}

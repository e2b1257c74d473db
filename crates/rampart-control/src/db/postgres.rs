//! PostgreSQL store.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_compiler::{ResourceSnapshot, StageBackend};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::*;
use super::store::{BindingWrite, ReleaseStore, RolloutSession, StoreError, StoreResult};
use crate::binding::BindingSource;
use crate::release::TriggerSource;

/// A [`ReleaseStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct GatewayRow {
    id: Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<GatewayRow> for Gateway {
    type Error = StoreError;

    fn try_from(row: GatewayRow) -> Result<Self, Self::Error> {
        Ok(Gateway {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct StageRow {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    status: String,
    vars: Json<BTreeMap<String, String>>,
    backends: Json<Vec<StageBackend>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<StageRow> for Stage {
    type Error = StoreError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        Ok(Stage {
            id: row.id,
            gateway_id: row.gateway_id,
            name: row.name,
            status: row.status.parse()?,
            vars: row.vars.0,
            backends: row.backends.0,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ResourceVersionRow {
    id: Uuid,
    gateway_id: Uuid,
    version: String,
    schema_version: String,
    resources: Json<Vec<ResourceSnapshot>>,
    created_at: DateTime<Utc>,
}

impl From<ResourceVersionRow> for ResourceVersion {
    fn from(row: ResourceVersionRow) -> Self {
        ResourceVersion {
            id: row.id,
            gateway_id: row.gateway_id,
            version: row.version,
            schema_version: row.schema_version,
            resources: row.resources.0,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct DataPlaneRow {
    id: Uuid,
    name: String,
    status: String,
    is_recommend: bool,
    key_prefix: String,
    registry: Json<RegistryBackendConfig>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DataPlaneRow> for DataPlane {
    type Error = StoreError;

    fn try_from(row: DataPlaneRow) -> Result<Self, Self::Error> {
        Ok(DataPlane {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            is_recommend: row.is_recommend,
            key_prefix: row.key_prefix,
            registry: row.registry.0,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct PluginBindingRow {
    id: Uuid,
    gateway_id: Uuid,
    scope_type: String,
    scope_id: Uuid,
    config_id: Uuid,
    plugin_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PluginBindingRow> for PluginBinding {
    type Error = StoreError;

    fn try_from(row: PluginBindingRow) -> Result<Self, Self::Error> {
        Ok(PluginBinding {
            id: row.id,
            gateway_id: row.gateway_id,
            scope_type: row.scope_type.parse()?,
            scope_id: row.scope_id,
            config_id: row.config_id,
            plugin_type: row.plugin_type,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StrategyBindingRow {
    id: Uuid,
    gateway_id: Uuid,
    scope_type: String,
    scope_id: Uuid,
    access_strategy_id: Uuid,
    strategy_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StrategyBindingRow> for AccessStrategyBinding {
    type Error = StoreError;

    fn try_from(row: StrategyBindingRow) -> Result<Self, Self::Error> {
        Ok(AccessStrategyBinding {
            id: row.id,
            gateway_id: row.gateway_id,
            scope_type: row.scope_type.parse()?,
            scope_id: row.scope_id,
            access_strategy_id: row.access_strategy_id,
            strategy_type: row.strategy_type,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PluginConfigRow {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    plugin_type: String,
    config: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PluginConfigRow> for PluginConfig {
    fn from(row: PluginConfigRow) -> Self {
        PluginConfig {
            id: row.id,
            gateway_id: row.gateway_id,
            name: row.name,
            plugin_type: row.plugin_type,
            config: row.config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct AccessStrategyRow {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    strategy_type: String,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccessStrategyRow> for AccessStrategy {
    fn from(row: AccessStrategyRow) -> Self {
        AccessStrategy {
            id: row.id,
            gateway_id: row.gateway_id,
            name: row.name,
            strategy_type: row.strategy_type,
            config: row.config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct IpGroupRow {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    ips: String,
}

#[derive(FromRow)]
struct ReleaseRow {
    id: Uuid,
    gateway_id: Uuid,
    stage_id: Uuid,
    resource_version_id: Uuid,
    comment: String,
    operator: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ReleaseRow> for Release {
    fn from(row: ReleaseRow) -> Self {
        Release {
            id: row.id,
            gateway_id: row.gateway_id,
            stage_id: row.stage_id,
            resource_version_id: row.resource_version_id,
            comment: row.comment,
            operator: row.operator,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct HistoryRow {
    id: Uuid,
    attempt_id: Uuid,
    gateway_id: Uuid,
    stage_id: Uuid,
    resource_version_id: Option<Uuid>,
    data_plane_id: Option<Uuid>,
    source: String,
    status: String,
    operator: String,
    comment: String,
    message: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<HistoryRow> for ReleaseHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let source = TriggerSource::parse(&row.source)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown trigger source '{}'", row.source)))?;
        Ok(ReleaseHistory {
            id: row.id,
            attempt_id: row.attempt_id,
            gateway_id: row.gateway_id,
            stage_id: row.stage_id,
            resource_version_id: row.resource_version_id,
            data_plane_id: row.data_plane_id,
            source,
            status: row.status.parse()?,
            operator: row.operator,
            comment: row.comment,
            message: row.message,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(FromRow)]
struct StateRow {
    gateway_id: Uuid,
    stage_id: Uuid,
    data_plane_id: Uuid,
    release_history_id: Uuid,
    resource_version_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    gateway_id: Uuid,
    stage_id: Uuid,
    data_plane_id: Uuid,
    release_history_id: Uuid,
    attempt_id: Uuid,
    resource_version_id: Option<Uuid>,
    operator: String,
    comment: String,
    attempts: i32,
    run_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for OutboxJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(OutboxJob {
            id: row.id,
            kind: row.kind.parse()?,
            gateway_id: row.gateway_id,
            stage_id: row.stage_id,
            data_plane_id: row.data_plane_id,
            release_history_id: row.release_history_id,
            attempt_id: row.attempt_id,
            resource_version_id: row.resource_version_id,
            operator: row.operator,
            comment: row.comment,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            run_at: row.run_at,
            locked_until: row.locked_until,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    history: &ReleaseHistory,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO release_histories
            (id, attempt_id, gateway_id, stage_id, resource_version_id, data_plane_id,
             source, status, operator, comment, message, created_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(history.id)
    .bind(history.attempt_id)
    .bind(history.gateway_id)
    .bind(history.stage_id)
    .bind(history.resource_version_id)
    .bind(history.data_plane_id)
    .bind(history.source.as_str())
    .bind(history.status.as_str())
    .bind(&history.operator)
    .bind(&history.comment)
    .bind(&history.message)
    .bind(history.created_at)
    .bind(history.finished_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &OutboxJob) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO release_outbox
            (id, kind, gateway_id, stage_id, data_plane_id, release_history_id, attempt_id,
             resource_version_id, operator, comment, attempts, run_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(job.id)
    .bind(job.kind.as_str())
    .bind(job.gateway_id)
    .bind(job.stage_id)
    .bind(job.data_plane_id)
    .bind(job.release_history_id)
    .bind(job.attempt_id)
    .bind(job.resource_version_id)
    .bind(&job.operator)
    .bind(&job.comment)
    .bind(i32::try_from(job.attempts).unwrap_or(i32::MAX))
    .bind(job.run_at)
    .bind(job.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn advisory_lock(tx: &mut Transaction<'_, Postgres>, key: &str) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fetch_applied_state<'e, E: PgExecutor<'e>>(
    executor: E,
    (gateway_id, stage_id, data_plane_id): (Uuid, Uuid, Uuid),
) -> StoreResult<Option<DataPlaneReleaseState>> {
    let row = sqlx::query_as::<_, StateRow>(
        r#"
        SELECT * FROM data_plane_release_states
        WHERE gateway_id = $1 AND stage_id = $2 AND data_plane_id = $3
        "#,
    )
    .bind(gateway_id)
    .bind(stage_id)
    .bind(data_plane_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|r| DataPlaneReleaseState {
        gateway_id: r.gateway_id,
        stage_id: r.stage_id,
        data_plane_id: r.data_plane_id,
        release_history_id: r.release_history_id,
        resource_version_id: r.resource_version_id,
        updated_at: r.updated_at,
    }))
}

async fn upsert_applied_state<'e, E: PgExecutor<'e>>(
    executor: E,
    state: &DataPlaneReleaseState,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO data_plane_release_states
            (gateway_id, stage_id, data_plane_id, release_history_id, resource_version_id, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (gateway_id, stage_id, data_plane_id) DO UPDATE SET
            release_history_id = EXCLUDED.release_history_id,
            resource_version_id = EXCLUDED.resource_version_id,
            updated_at = EXCLUDED.updated_at
        WHERE data_plane_release_states.release_history_id < EXCLUDED.release_history_id
        "#,
    )
    .bind(state.gateway_id)
    .bind(state.stage_id)
    .bind(state.data_plane_id)
    .bind(state.release_history_id)
    .bind(state.resource_version_id)
    .bind(state.updated_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Holds the rollout advisory lock until the transaction ends.
struct PgRolloutSession {
    tx: Transaction<'static, Postgres>,
    key: (Uuid, Uuid, Uuid),
}

#[async_trait]
impl RolloutSession for PgRolloutSession {
    async fn applied_state(&mut self) -> StoreResult<Option<DataPlaneReleaseState>> {
        fetch_applied_state(&mut *self.tx, self.key).await
    }

    async fn advance(&mut self, state: &DataPlaneReleaseState) -> StoreResult<bool> {
        upsert_applied_state(&mut *self.tx, state).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ReleaseStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_gateway(&self, id: Uuid) -> StoreResult<Option<Gateway>> {
        sqlx::query_as::<_, GatewayRow>("SELECT * FROM gateways WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Gateway::try_from)
            .transpose()
    }

    async fn get_stage(&self, id: Uuid) -> StoreResult<Option<Stage>> {
        sqlx::query_as::<_, StageRow>("SELECT * FROM stages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Stage::try_from)
            .transpose()
    }

    async fn list_stages(&self, gateway_id: Uuid) -> StoreResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            "SELECT * FROM stages WHERE gateway_id = $1 ORDER BY name",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_resource_version(&self, id: Uuid) -> StoreResult<Option<ResourceVersion>> {
        let row =
            sqlx::query_as::<_, ResourceVersionRow>("SELECT * FROM resource_versions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(ResourceVersion::from))
    }

    async fn get_data_plane(&self, id: Uuid) -> StoreResult<Option<DataPlane>> {
        sqlx::query_as::<_, DataPlaneRow>("SELECT * FROM data_planes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(DataPlane::try_from)
            .transpose()
    }

    async fn active_data_planes(&self, gateway_id: Uuid) -> StoreResult<Vec<DataPlane>> {
        let rows = sqlx::query_as::<_, DataPlaneRow>(
            r#"
            SELECT dp.* FROM data_planes dp
            JOIN gateway_data_planes gdp ON gdp.data_plane_id = dp.id
            WHERE gdp.gateway_id = $1 AND dp.status = 'active'
            ORDER BY dp.name
            "#,
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_plugin_config(&self, id: Uuid) -> StoreResult<Option<PluginConfig>> {
        let row = sqlx::query_as::<_, PluginConfigRow>("SELECT * FROM plugin_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PluginConfig::from))
    }

    async fn list_plugin_configs(&self, gateway_id: Uuid) -> StoreResult<Vec<PluginConfig>> {
        let rows = sqlx::query_as::<_, PluginConfigRow>(
            "SELECT * FROM plugin_configs WHERE gateway_id = $1 ORDER BY created_at",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PluginConfig::from).collect())
    }

    async fn get_access_strategy(&self, id: Uuid) -> StoreResult<Option<AccessStrategy>> {
        let row =
            sqlx::query_as::<_, AccessStrategyRow>("SELECT * FROM access_strategies WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(AccessStrategy::from))
    }

    async fn list_access_strategies(&self, gateway_id: Uuid) -> StoreResult<Vec<AccessStrategy>> {
        let rows = sqlx::query_as::<_, AccessStrategyRow>(
            "SELECT * FROM access_strategies WHERE gateway_id = $1 ORDER BY created_at",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AccessStrategy::from).collect())
    }

    async fn list_ip_groups(&self, gateway_id: Uuid) -> StoreResult<Vec<IpGroup>> {
        let rows = sqlx::query_as::<_, IpGroupRow>(
            "SELECT id, gateway_id, name, ips FROM ip_groups WHERE gateway_id = $1",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| IpGroup {
                id: r.id,
                gateway_id: r.gateway_id,
                name: r.name,
                ips: r.ips,
            })
            .collect())
    }

    async fn list_plugin_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<PluginBinding>> {
        let rows = sqlx::query_as::<_, PluginBindingRow>(
            r#"
            SELECT * FROM plugin_bindings
            WHERE gateway_id = $1 AND scope_type = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(gateway_id)
        .bind(scope_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_strategy_bindings(
        &self,
        gateway_id: Uuid,
        scope_type: ScopeType,
    ) -> StoreResult<Vec<AccessStrategyBinding>> {
        let rows = sqlx::query_as::<_, StrategyBindingRow>(
            r#"
            SELECT * FROM access_strategy_bindings
            WHERE gateway_id = $1 AND scope_type = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(gateway_id)
        .bind(scope_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn apply_bindings(&self, changes: &BindingChanges) -> StoreResult<BindingWrite> {
        let mut tx = self.pool.begin().await?;
        let scope_type = changes.scope_type.as_str();
        // Row locks cannot cover bindings that do not exist yet.
        advisory_lock(&mut tx, &format!("bindings:{}", changes.gateway_id)).await?;

        let other_table = match changes.source {
            BindingSource::PluginConfig { .. } => {
                "SELECT scope_id FROM access_strategy_bindings WHERE gateway_id = $1 AND scope_type = $2 AND strategy_type = ANY($3) AND scope_id = ANY($4) FOR UPDATE"
            }
            BindingSource::AccessStrategy { .. } => {
                "SELECT scope_id FROM plugin_bindings WHERE gateway_id = $1 AND scope_type = $2 AND plugin_type = ANY($3) AND scope_id = ANY($4) FOR UPDATE"
            }
        };
        let codes: Vec<String> = changes
            .conflicting_codes
            .iter()
            .map(|code| code.to_string())
            .collect();
        let taken: Vec<Uuid> = sqlx::query_scalar(other_table)
            .bind(changes.gateway_id)
            .bind(scope_type)
            .bind(&codes)
            .bind(&changes.upsert)
            .fetch_all(&mut *tx)
            .await?;
        if let Some(scope_id) = changes.upsert.iter().find(|id| taken.contains(id)) {
            tx.rollback().await?;
            return Ok(BindingWrite::Conflict {
                scope_id: *scope_id,
            });
        }

        let ids: Vec<Uuid> = changes.upsert.iter().map(|_| Uuid::new_v4()).collect();

        match changes.source {
            BindingSource::PluginConfig { id, plugin_type } => {
                sqlx::query(
                    "DELETE FROM plugin_bindings WHERE scope_type = $1 AND config_id = $2 AND scope_id = ANY($3)",
                )
                .bind(scope_type)
                .bind(id)
                .bind(&changes.delete)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO plugin_bindings
                        (id, gateway_id, scope_type, scope_id, config_id, plugin_type, created_at, updated_at)
                    SELECT t.id, $1, $2, t.scope_id, $3, $4, NOW(), NOW()
                    FROM UNNEST($5::uuid[], $6::uuid[]) AS t(id, scope_id)
                    ON CONFLICT (scope_type, scope_id, plugin_type)
                    DO UPDATE SET config_id = EXCLUDED.config_id, updated_at = NOW()
                    "#,
                )
                .bind(changes.gateway_id)
                .bind(scope_type)
                .bind(id)
                .bind(plugin_type.code())
                .bind(&ids)
                .bind(&changes.upsert)
                .execute(&mut *tx)
                .await?;
            }
            BindingSource::AccessStrategy { id, strategy_type } => {
                sqlx::query(
                    "DELETE FROM access_strategy_bindings WHERE scope_type = $1 AND access_strategy_id = $2 AND scope_id = ANY($3)",
                )
                .bind(scope_type)
                .bind(id)
                .bind(&changes.delete)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO access_strategy_bindings
                        (id, gateway_id, scope_type, scope_id, access_strategy_id, strategy_type, created_at, updated_at)
                    SELECT t.id, $1, $2, t.scope_id, $3, $4, NOW(), NOW()
                    FROM UNNEST($5::uuid[], $6::uuid[]) AS t(id, scope_id)
                    ON CONFLICT (scope_type, scope_id, strategy_type)
                    DO UPDATE SET access_strategy_id = EXCLUDED.access_strategy_id, updated_at = NOW()
                    "#,
                )
                .bind(changes.gateway_id)
                .bind(scope_type)
                .bind(id)
                .bind(strategy_type.code())
                .bind(&ids)
                .bind(&changes.upsert)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(BindingWrite::Applied)
    }

    async fn get_release(&self, gateway_id: Uuid, stage_id: Uuid) -> StoreResult<Option<Release>> {
        let row = sqlx::query_as::<_, ReleaseRow>(
            "SELECT * FROM releases WHERE gateway_id = $1 AND stage_id = $2",
        )
        .bind(gateway_id)
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Release::from))
    }

    async fn commit_release(&self, commit: ReleaseCommit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        match &commit.pointer {
            PointerChange::Keep => {}
            PointerChange::Upsert(release) => {
                sqlx::query(
                    r#"
                    INSERT INTO releases
                        (id, gateway_id, stage_id, resource_version_id, comment, operator, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (gateway_id, stage_id) DO UPDATE SET
                        resource_version_id = EXCLUDED.resource_version_id,
                        comment = EXCLUDED.comment,
                        operator = EXCLUDED.operator,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(release.id)
                .bind(release.gateway_id)
                .bind(release.stage_id)
                .bind(release.resource_version_id)
                .bind(&release.comment)
                .bind(&release.operator)
                .bind(release.created_at)
                .bind(release.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            PointerChange::Remove {
                gateway_id,
                stage_id,
            } => {
                sqlx::query("DELETE FROM releases WHERE gateway_id = $1 AND stage_id = $2")
                    .bind(gateway_id)
                    .bind(stage_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for history in &commit.histories {
            insert_history(&mut tx, history).await?;
        }
        for job in &commit.jobs {
            insert_job(&mut tx, job).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_history(&self, id: Uuid) -> StoreResult<Option<ReleaseHistory>> {
        sqlx::query_as::<_, HistoryRow>("SELECT * FROM release_histories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ReleaseHistory::try_from)
            .transpose()
    }

    async fn list_histories(
        &self,
        gateway_id: Uuid,
        stage_id: Option<Uuid>,
    ) -> StoreResult<Vec<ReleaseHistory>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT * FROM release_histories
            WHERE gateway_id = $1 AND ($2::uuid IS NULL OR stage_id = $2)
            ORDER BY id DESC
            "#,
        )
        .bind(gateway_id)
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn attempt_histories(&self, attempt_id: Uuid) -> StoreResult<Vec<ReleaseHistory>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM release_histories WHERE attempt_id = $1 ORDER BY id",
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn finish_history(
        &self,
        id: Uuid,
        status: HistoryStatus,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE release_histories
            SET status = $2, message = $3, finished_at = $4
            WHERE id = $1 AND status = 'doing'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(finished_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_applied_state(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Option<DataPlaneReleaseState>> {
        fetch_applied_state(&self.pool, (gateway_id, stage_id, data_plane_id)).await
    }

    async fn begin_rollout(
        &self,
        gateway_id: Uuid,
        stage_id: Uuid,
        data_plane_id: Uuid,
    ) -> StoreResult<Box<dyn RolloutSession>> {
        let mut tx = self.pool.begin().await?;
        advisory_lock(
            &mut tx,
            &format!("rollout:{gateway_id}:{stage_id}:{data_plane_id}"),
        )
        .await?;
        Ok(Box::new(PgRolloutSession {
            tx,
            key: (gateway_id, stage_id, data_plane_id),
        }))
    }

    async fn claim_jobs(&self, limit: usize, lease: Duration) -> StoreResult<Vec<OutboxJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE release_outbox
            SET locked_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM release_outbox
                WHERE run_at <= NOW() AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        let mut jobs: Vec<OutboxJob> = convert_all(rows)?;
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE release_outbox
            SET attempts = attempts + 1, run_at = $2, locked_until = NULL, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM release_outbox WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_jobs(&self) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM release_outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

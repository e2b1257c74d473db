//! PostgreSQL registry backend.
//!
//! Every data plane gets its own `namespace` inside `registry_resources`.
//! A sync runs in a single transaction guarded by an advisory lock on the
//! prefix, so concurrent writers to the same gateway+stage are serialized
//! and readers never observe a half-written generation.

use std::future::Future;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::resource::{RegistryScope, ResourceKind, ResourceObject};
use crate::retry::RetryPolicy;
use crate::{ensure_unique_keys, Registry, SyncSummary};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS registry_resources (
    namespace   UUID        NOT NULL,
    key         TEXT        NOT NULL,
    kind        TEXT        NOT NULL,
    resource_id TEXT        NOT NULL,
    body        JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (namespace, key)
)
"#;

/// A [`Registry`] stored in PostgreSQL.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
    namespace: Uuid,
    scope: RegistryScope,
    retry: RetryPolicy,
}

impl PgRegistry {
    pub fn new(pool: PgPool, namespace: Uuid, scope: RegistryScope, retry: RetryPolicy) -> Self {
        Self {
            pool,
            namespace,
            scope,
            retry,
        }
    }

    /// Create the backing table if it does not exist yet.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), RegistryError> {
        sqlx::query(CREATE_TABLE)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && self.retry.can_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        prefix = %self.scope,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient registry error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(map_sqlx_error(e)),
            }
        }
    }

    async fn lock_prefix(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
        let lock_key = format!("{}:{}", self.namespace, self.scope.prefix());
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(lock_key)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        resource: &ResourceObject,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO registry_resources (namespace, key, kind, resource_id, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace, key)
            DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()
            "#,
        )
        .bind(self.namespace)
        .bind(self.scope.key(resource.kind, &resource.id))
        .bind(resource.kind.as_str())
        .bind(&resource.id)
        .bind(&resource.body)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn sync_once(&self, resources: &[ResourceObject]) -> Result<SyncSummary, sqlx::Error> {
        let keys: Vec<String> = resources
            .iter()
            .map(|r| self.scope.key(r.kind, &r.id))
            .collect();

        let mut tx = self.pool.begin().await?;
        self.lock_prefix(&mut tx).await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM registry_resources
            WHERE namespace = $1 AND starts_with(key, $2) AND NOT (key = ANY($3))
            "#,
        )
        .bind(self.namespace)
        .bind(self.scope.prefix())
        .bind(&keys)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for resource in resources {
            self.upsert(&mut tx, resource).await?;
        }

        tx.commit().await?;
        Ok(SyncSummary {
            upserted: resources.len(),
            deleted: deleted as usize,
        })
    }
}

#[async_trait]
impl Registry for PgRegistry {
    fn scope(&self) -> &RegistryScope {
        &self.scope
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn apply(&self, resource: &ResourceObject) -> Result<(), RegistryError> {
        self.with_retry("apply", move || async move {
            let mut tx = self.pool.begin().await?;
            self.lock_prefix(&mut tx).await?;
            self.upsert(&mut tx, resource).await?;
            tx.commit().await
        })
        .await
    }

    async fn sync_by_prefix(
        &self,
        resources: &[ResourceObject],
    ) -> Result<SyncSummary, RegistryError> {
        ensure_unique_keys(&self.scope, resources)?;
        self.with_retry("sync_by_prefix", move || self.sync_once(resources))
            .await
    }

    async fn delete_by_prefix(&self) -> Result<usize, RegistryError> {
        self.with_retry("delete_by_prefix", move || async move {
            let mut tx = self.pool.begin().await?;
            self.lock_prefix(&mut tx).await?;
            let removed = sqlx::query(
                "DELETE FROM registry_resources WHERE namespace = $1 AND starts_with(key, $2)",
            )
            .bind(self.namespace)
            .bind(self.scope.prefix())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok(removed as usize)
        })
        .await
    }

    async fn list_by_kind(&self, kind: ResourceKind) -> Result<Vec<ResourceObject>, RegistryError> {
        let kind_prefix = format!("{}{}/", self.scope.prefix(), kind.as_str());
        let kind_prefix = kind_prefix.as_str();
        let rows = self
            .with_retry("list_by_kind", move || {
                sqlx::query(
                    r#"
                    SELECT resource_id, body FROM registry_resources
                    WHERE namespace = $1 AND starts_with(key, $2)
                    ORDER BY key
                    "#,
                )
                .bind(self.namespace)
                .bind(kind_prefix)
                .fetch_all(&self.pool)
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ResourceObject {
                    kind,
                    id: row.try_get("resource_id").map_err(map_sqlx_error)?,
                    body: row.try_get("body").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        let count: i64 = self
            .with_retry("count", move || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM registry_resources WHERE namespace = $1 AND starts_with(key, $2)",
                )
                .bind(self.namespace)
                .bind(self.scope.prefix())
                .fetch_one(&self.pool)
            })
            .await?;
        Ok(count as usize)
    }
}

/// SQLSTATE classes worth retrying: connection exceptions, serialization
/// failures, deadlocks and operator intervention (server restarts).
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                code.starts_with("08") || code == "40001" || code == "40P01" || code.starts_with("57P")
            })
            .unwrap_or(false),
        _ => false,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> RegistryError {
    if is_transient(&err) {
        RegistryError::Unavailable(err.to_string())
    } else {
        RegistryError::Backend(err.to_string())
    }
}

//! Resolves the registry of a data plane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rampart_registry::{
    MemoryBackend, PgRegistry, Registry, RegistryError, RegistryScope,
    RetryPolicy,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{DataPlane, RegistryBackendConfig};

/// Opens registries for data planes.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    /// The registry of `data_plane` confined to `gateway`/`stage`.
    async fn registry(
        &self,
        data_plane: &DataPlane,
        gateway: &str,
        stage: &str,
    ) -> Result<Arc<dyn Registry>, RegistryError>;
}

/// Keeps one memory backend per data plane and one pool per database URL.
pub struct DefaultRegistryProvider {
    default_key_prefix: String,
    retry: RetryPolicy,
    memory: DashMap<Uuid, Arc<MemoryBackend>>,
    pools: DashMap<String, PgPool>,
}

impl DefaultRegistryProvider {
    pub fn new(default_key_prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            default_key_prefix: default_key_prefix.into(),
            retry,
            memory: DashMap::new(),
            pools: DashMap::new(),
        }
    }

    /// The shared memory backend of a data plane, created on first use.
    pub fn memory_backend(&self, data_plane_id: Uuid) -> Arc<MemoryBackend> {
        self.memory
            .entry(data_plane_id)
            .or_insert_with(MemoryBackend::shared)
            .clone()
    }

    fn scope(&self, data_plane: &DataPlane, gateway: &str, stage: &str) -> RegistryScope {
        let prefix = if data_plane.key_prefix.trim().is_empty() {
            self.default_key_prefix.as_str()
        } else {
            data_plane.key_prefix.as_str()
        };
        RegistryScope::new(prefix, gateway, stage)
    }

    async fn pool(&self, url: &str) -> Result<PgPool, RegistryError> {
        if let Some(pool) = self.pools.get(url) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        PgRegistry::ensure_schema(&pool).await?;
        tracing::info!(url = %redact(url), "connected registry database");
        Ok(self.pools.entry(url.to_string()).or_insert(pool).clone())
    }
}

/// Drop credentials from a database URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl RegistryProvider for DefaultRegistryProvider {
    async fn registry(
        &self,
        data_plane: &DataPlane,
        gateway: &str,
        stage: &str,
    ) -> Result<Arc<dyn Registry>, RegistryError> {
        let scope = self.scope(data_plane, gateway, stage);
        match &data_plane.registry {
            RegistryBackendConfig::Memory => {
                let backend = self.memory_backend(data_plane.id);
                Ok(Arc::new(backend.registry(scope)) as Arc<dyn Registry>)
            }
            RegistryBackendConfig::Postgres { url, namespace } => {
                let pool = self.pool(url).await?;
                let namespace = namespace.unwrap_or(data_plane.id);
                Ok(Arc::new(PgRegistry::new(pool, namespace, scope, self.retry)))
            }
        }
    }
}

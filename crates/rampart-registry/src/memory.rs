//! In-memory registry backend.
//!
//! One [`MemoryBackend`] stands for one data plane's store; every
//! gateway+stage gets its own [`MemoryRegistry`] view over it. A sync holds
//! the write lock for the whole generation swap, so readers see either the
//! old or the new generation.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::resource::{RegistryScope, ResourceKind, ResourceObject};
use crate::{ensure_unique_keys, Registry, SyncSummary};

/// Shared key/value store behind [`MemoryRegistry`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, ResourceObject>>,
    unavailable: AtomicBool,
    revision: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the store becoming (un)reachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Incremented on every successful write.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// All keys currently stored, across every prefix.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A registry view confined to `scope`.
    pub fn registry(self: &Arc<Self>, scope: RegistryScope) -> MemoryRegistry {
        MemoryRegistry {
            backend: Arc::clone(self),
            scope,
        }
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(
                "memory backend is marked unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`Registry`] over a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    backend: Arc<MemoryBackend>,
    scope: RegistryScope,
}

impl MemoryRegistry {
    pub fn new(scope: RegistryScope) -> Self {
        MemoryBackend::shared().registry(scope)
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn scope(&self) -> &RegistryScope {
        &self.scope
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, resource: &ResourceObject) -> Result<(), RegistryError> {
        self.backend.check_available()?;
        let key = self.scope.key(resource.kind, &resource.id);
        self.backend.entries.write().insert(key, resource.clone());
        self.backend.bump();
        Ok(())
    }

    async fn sync_by_prefix(
        &self,
        resources: &[ResourceObject],
    ) -> Result<SyncSummary, RegistryError> {
        self.backend.check_available()?;
        ensure_unique_keys(&self.scope, resources)?;

        let prefix = self.scope.prefix();
        let incoming: Vec<(String, ResourceObject)> = resources
            .iter()
            .map(|r| (self.scope.key(r.kind, &r.id), r.clone()))
            .collect();
        let wanted: HashSet<&str> = incoming.iter().map(|(k, _)| k.as_str()).collect();

        let mut entries = self.backend.entries.write();
        let stale: Vec<String> = entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !wanted.contains(k.as_str()))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.remove(key);
        }
        let upserted = incoming.len();
        entries.extend(incoming);
        drop(entries);

        self.backend.bump();
        Ok(SyncSummary {
            upserted,
            deleted: stale.len(),
        })
    }

    async fn delete_by_prefix(&self) -> Result<usize, RegistryError> {
        self.backend.check_available()?;
        let prefix = self.scope.prefix();
        let mut entries = self.backend.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(&prefix));
        let removed = before - entries.len();
        drop(entries);
        self.backend.bump();
        Ok(removed)
    }

    async fn list_by_kind(&self, kind: ResourceKind) -> Result<Vec<ResourceObject>, RegistryError> {
        self.backend.check_available()?;
        let kind_prefix = format!("{}{}/", self.scope.prefix(), kind.as_str());
        let entries = self.backend.entries.read();
        Ok(entries
            .range(kind_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&kind_prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        self.backend.check_available()?;
        let prefix = self.scope.prefix();
        let entries = self.backend.entries.read();
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .count())
    }
}

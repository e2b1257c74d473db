//! Prefix-scoped registry of typed resource objects.
//!
//! A registry is what a data plane's reconciliation loop reads: every
//! resource lives under `{key_prefix}/{gateway}/{stage}/{type}/{id}` and a
//! release replaces the whole `{key_prefix}/{gateway}/{stage}/` generation at
//! once through [`Registry::sync_by_prefix`].

pub mod error;
pub mod memory;
pub mod postgres;
pub mod resource;
pub mod retry;
pub mod types;

use std::marker::PhantomData;

use async_trait::async_trait;

pub use error::RegistryError;
pub use memory::{MemoryBackend, MemoryRegistry};
pub use postgres::PgRegistry;
pub use resource::{RegistryScope, ResourceKind, ResourceObject, TypedResource};
pub use retry::RetryPolicy;
pub use types::{
    PluginEntry, PluginMetadata, Route, RouteTimeout, Service, Upstream, UpstreamNode,
};

/// Outcome of a prefix sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Number of objects written (created or replaced).
    pub upserted: usize,
    /// Number of stale keys removed from the prefix.
    pub deleted: usize,
}

/// A registry bound to one gateway+stage prefix.
#[async_trait]
pub trait Registry: Send + Sync {
    /// The prefix this registry writes under.
    fn scope(&self) -> &RegistryScope;

    /// Short backend name used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Idempotent upsert of a single resource.
    async fn apply(&self, resource: &ResourceObject) -> Result<(), RegistryError>;

    /// Replace the prefix content with exactly `resources`.
    ///
    /// Either the whole new generation is visible afterwards or the previous
    /// one is left untouched. An empty slice clears the prefix.
    async fn sync_by_prefix(&self, resources: &[ResourceObject])
        -> Result<SyncSummary, RegistryError>;

    /// Remove every resource under the prefix. Returns the number removed.
    async fn delete_by_prefix(&self) -> Result<usize, RegistryError>;

    /// Copies of every resource of one kind under the prefix, ordered by key.
    async fn list_by_kind(&self, kind: ResourceKind) -> Result<Vec<ResourceObject>, RegistryError>;

    /// Number of keys under the prefix.
    async fn count(&self) -> Result<usize, RegistryError>;
}

/// Typed helpers available on every [`Registry`].
#[async_trait]
pub trait RegistryExt {
    /// Lazily decoded resources of type `T` under the prefix.
    async fn iter_by_type<T: TypedResource + Send>(&self) -> Result<ResourceIter<T>, RegistryError>;

    /// Serialize and upsert a typed resource.
    async fn apply_typed<T: TypedResource + Sync>(&self, resource: &T) -> Result<(), RegistryError>;
}

#[async_trait]
impl<R: Registry + ?Sized> RegistryExt for R {
    async fn iter_by_type<T: TypedResource + Send>(&self) -> Result<ResourceIter<T>, RegistryError> {
        let objects = self.list_by_kind(T::KIND).await?;
        Ok(ResourceIter::new(objects))
    }

    async fn apply_typed<T: TypedResource + Sync>(&self, resource: &T) -> Result<(), RegistryError> {
        let object = resource.to_object()?;
        self.apply(&object).await
    }
}

/// Restartable iterator decoding registry objects into `T` on demand.
///
/// Cloning the iterator (or calling [`ResourceIter::rewind`]) starts the
/// sequence over from the same snapshot.
#[derive(Debug)]
pub struct ResourceIter<T> {
    objects: Vec<ResourceObject>,
    position: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceIter<T> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
            position: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> ResourceIter<T> {
    fn new(objects: Vec<ResourceObject>) -> Self {
        Self {
            objects,
            position: 0,
            _marker: PhantomData,
        }
    }

    /// Restart from the first object.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Total number of objects in the snapshot.
    pub fn total(&self) -> usize {
        self.objects.len()
    }
}

impl<T: TypedResource> Iterator for ResourceIter<T> {
    type Item = Result<T, RegistryError>;

    fn next(&mut self) -> Option<Self::Item> {
        let object = self.objects.get(self.position)?;
        self.position += 1;
        Some(T::from_object(object))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.objects.len() - self.position;
        (remaining, Some(remaining))
    }
}

/// Reject inputs that would write the same key twice in one generation.
pub(crate) fn ensure_unique_keys(
    scope: &RegistryScope,
    resources: &[ResourceObject],
) -> Result<(), RegistryError> {
    let mut seen = std::collections::HashSet::with_capacity(resources.len());
    for resource in resources {
        let key = scope.key(resource.kind, &resource.id);
        if !seen.insert(key.clone()) {
            return Err(RegistryError::DuplicateKey(key));
        }
    }
    Ok(())
}

//! Async mutexes created on demand per key.
//!
//! An entry lives only while some task holds or waits for it, so the map
//! stays as small as the set of keys currently in use.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = DashMap<K, Arc<Mutex<()>>>;

pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Wait for the lock of `key`.
    pub(crate) async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K: Eq + Hash> KeyedLocks<K> {
    /// Keys currently held or waited on.
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash> std::fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks").field("held", &self.len()).finish()
    }
}

pub(crate) struct KeyedGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, so the entry stays while anyone queues on it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn entry_is_removed_after_release() {
        let locks = KeyedLocks::default();
        let guard = locks.lock("a").await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::default());
        let first = locks.lock(1).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::default();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        assert_eq!(locks.len(), 2);
    }
}

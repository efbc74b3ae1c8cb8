use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use itertools::Itertools;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;

use super::error::KeyedLockError;
use super::hooks::{Hooks, NoopHooks};
use super::keyed_lock::KeyedLock;
use super::pool::{KeyedLockPool, PoolId};

/// A [KeyedLockPool] that evicts entries optimistically. **It is not safe under contention.**
///
/// It has the same fast path as [LockFreeRetryPool](crate::LockFreeRetryPool), but
/// - releasing removes the map entry whenever it sees a reference count of one *before* decrementing it,
///   without checking that the entry is still the same lock or that nobody obtained it in between, and
/// - obtaining a lock whose count was already zero revives it and overwrites whatever is in the map slot.
///
/// If an obtain for an id slips in between a release's check and its removal, the obtained lock stays
/// referenced but isn't discoverable anymore. The next obtain for that id creates a second lock, and two
/// threads can then hold "the" lock for one id at the same time. Mutual exclusion is silently broken.
///
/// This pool only exists to compare against [LockFreeRetryPool](crate::LockFreeRetryPool) and
/// [SynchronizedPool](crate::SynchronizedPool). Don't use it to protect anything.
pub struct OptimisticPool<K, H = NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    id: PoolId,
    locks: DashMap<K, Arc<KeyedLock<K>>>,
    hooks: H,
}

impl<K> OptimisticPool<K, NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a new pool without any locks.
    #[inline]
    pub fn new() -> Self {
        Self::with_hooks(NoopHooks)
    }

    /// Create a new pool with room for `capacity` ids before its map has to grow.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hooks(capacity, NoopHooks)
    }
}

impl<K> Default for OptimisticPool<K, NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H> OptimisticPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    /// Create a new pool that calls the given hooks when entries are created or evicted.
    #[inline]
    pub fn with_hooks(hooks: H) -> Self {
        Self::with_capacity_and_hooks(0, hooks)
    }

    /// Create a new pool with the given capacity and hooks.
    pub fn with_capacity_and_hooks(capacity: usize, hooks: H) -> Self {
        let id = PoolId::next();
        tracing::warn!(pool = %id, "OptimisticPool can hand out two live locks for the same id under contention");
        Self {
            id,
            locks: DashMap::with_capacity(capacity),
            hooks,
        }
    }
}

impl<K, H> KeyedLockPool<K> for OptimisticPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    fn lock_ids(&self) -> Vec<K> {
        self.locks
            .iter()
            .filter(|entry| entry.value().reference_count() > 0)
            .map(|entry| entry.key().clone())
            .collect_vec()
    }

    fn lock_count(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().reference_count() > 0)
            .count()
    }

    fn obtain_lock(&self, id: K) -> Arc<KeyedLock<K>> {
        let existing = match self.locks.entry(id.clone()) {
            Entry::Vacant(entry) => {
                let lock = Arc::new(KeyedLock::new(id, self.id));
                entry.insert(Arc::clone(&lock));
                tracing::trace!(pool = %self.id, id = ?lock.id(), "Created lock");
                self.hooks.on_create(lock.id());
                return lock;
            }
            Entry::Occupied(entry) => Arc::clone(entry.get()),
        };

        if existing.increase_references() == 1 {
            // We revived a lock somebody is evicting. Put it back, no matter what the slot holds by now.
            tracing::debug!(pool = %self.id, ?id, "Revived lock that was evicted concurrently");
            self.locks.insert(id, Arc::clone(&existing));
        }
        existing
    }

    fn release_lock(&self, lock: &KeyedLock<K>) -> Result<(), KeyedLockError> {
        if lock.owner() != self.id {
            return Err(KeyedLockError::ForeignLock);
        }

        if lock.reference_count() == 1 {
            // Looks like we're the last one. By the time we remove it, that may not be true anymore.
            self.hooks.on_last_release(lock.id());
            if self.locks.remove(lock.id()).is_some() {
                tracing::trace!(pool = %self.id, id = ?lock.id(), "Evicted lock");
                self.hooks.on_evict(lock.id());
            }
        }
        lock.decrease_references()
            .ok_or(KeyedLockError::NotReferenced)?;
        Ok(())
    }
}

impl<K, H> Debug for OptimisticPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticPool")
            .field("id", &self.id)
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

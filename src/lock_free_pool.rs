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

/// A [KeyedLockPool] based on a concurrent map and lock-free reference counting.
///
/// Obtaining and releasing locks for different ids doesn't contend on a shared mutex. Map slots are only
/// changed through atomic entry operations (insert-if-absent, replace-if-equal, remove-if-equal), and reference
/// counts only through compare-and-swap.
///
/// The interesting race is between a release that drops the count of a lock to zero and an obtain for the
/// same id that still finds the dying lock in the map. A dying lock is never revived. Instead, the obtain
/// replaces it with a fresh lock, and the releaser's remove-if-equal then sees that the slot changed and
/// leaves the fresh lock alone. If yet another thread won the slot first, the obtain retries and joins that one.
///
/// ```
/// use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, LockFreeRetryPool};
/// use std::sync::Arc;
///
/// let pool = Arc::new(LockFreeRetryPool::new());
/// let threads: Vec<_> = (0..4)
///     .map(|i| {
///         let pool = Arc::clone(&pool);
///         std::thread::spawn(move || {
///             let _guard = pool.lock(i % 2);
///         })
///     })
///     .collect();
/// for thread in threads {
///     thread.join().unwrap();
/// }
/// assert_eq!(0, pool.lock_count());
/// ```
pub struct LockFreeRetryPool<K, H = NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    id: PoolId,

    // Can briefly contain dead locks (reference count zero) between a release and its eviction.
    // Those are never handed out and never counted.
    locks: DashMap<K, Arc<KeyedLock<K>>>,

    hooks: H,
}

impl<K> LockFreeRetryPool<K, NoopHooks>
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

impl<K> Default for LockFreeRetryPool<K, NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H> LockFreeRetryPool<K, H>
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
    #[inline]
    pub fn with_capacity_and_hooks(capacity: usize, hooks: H) -> Self {
        Self {
            id: PoolId::next(),
            locks: DashMap::with_capacity(capacity),
            hooks,
        }
    }

    fn _created(&self, lock: Arc<KeyedLock<K>>) -> Arc<KeyedLock<K>> {
        tracing::trace!(pool = %self.id, id = ?lock.id(), "Created lock");
        self.hooks.on_create(lock.id());
        lock
    }

    /// Replace the dying lock in the slot for `id` with a fresh one.
    /// Returns [None] if a different lock already took the slot, in which case the caller has to start over.
    fn _republish(&self, id: &K, dying: &Arc<KeyedLock<K>>) -> Option<Arc<KeyedLock<K>>> {
        let fresh = match self.locks.entry(id.clone()) {
            Entry::Occupied(mut entry) if Arc::ptr_eq(entry.get(), dying) => {
                let fresh = Arc::new(KeyedLock::new(id.clone(), self.id));
                entry.insert(Arc::clone(&fresh));
                fresh
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(KeyedLock::new(id.clone(), self.id));
                entry.insert(Arc::clone(&fresh));
                fresh
            }
            Entry::Occupied(_) => return None,
        };
        tracing::debug!(pool = %self.id, ?id, "Republished lock that was evicted concurrently");
        Some(self._created(fresh))
    }
}

impl<K, H> KeyedLockPool<K> for LockFreeRetryPool<K, H>
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
        loop {
            // Fast path: nobody holds this id, publish a fresh lock that already carries our reference.
            let existing = match self.locks.entry(id.clone()) {
                Entry::Vacant(entry) => {
                    let lock = Arc::new(KeyedLock::new(id.clone(), self.id));
                    entry.insert(Arc::clone(&lock));
                    return self._created(lock);
                }
                Entry::Occupied(entry) => Arc::clone(entry.get()),
            };

            // The map entry isn't locked anymore, so a concurrent release may drop the count to zero at any time.
            if existing.try_increase_references().is_some() {
                return existing;
            }

            // The count was zero, a releaser is in the middle of evicting this lock.
            if let Some(fresh) = self._republish(&id, &existing) {
                return fresh;
            }
            tracing::debug!(pool = %self.id, ?id, "Lock was replaced concurrently, retrying");
        }
    }

    fn release_lock(&self, lock: &KeyedLock<K>) -> Result<(), KeyedLockError> {
        if lock.owner() != self.id {
            return Err(KeyedLockError::ForeignLock);
        }

        let remaining = lock
            .decrease_references()
            .ok_or(KeyedLockError::NotReferenced)?;
        if remaining > 0 {
            return Ok(());
        }

        // The count hit zero, so the lock is dead. Nobody can obtain it anymore, but it is still in the map.
        self.hooks.on_last_release(lock.id());
        let removed = self
            .locks
            .remove_if(lock.id(), |_, published| std::ptr::eq(&**published, lock));
        if removed.is_some() {
            tracing::trace!(pool = %self.id, id = ?lock.id(), "Evicted lock");
            self.hooks.on_evict(lock.id());
        } else {
            // A concurrent obtain already replaced it with a fresh lock
            tracing::debug!(pool = %self.id, id = ?lock.id(), "Skipped eviction, lock was already replaced");
        }
        Ok(())
    }
}

impl<K, H> Debug for LockFreeRetryPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeRetryPool")
            .field("id", &self.id)
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::LockFreeRetryPool;
    crate::instantiate_pool_tests!(LockFreeRetryPool);

    mod eviction_race {
        use super::LockFreeRetryPool;
        use crate::KeyedLockPool;
        use crate::tests::CountingHooks;
        use std::sync::Arc;
        use std::sync::atomic::Ordering;

        #[test]
        fn dying_lock_is_replaced_by_fresh_lock() {
            let hooks = Arc::new(CountingHooks::default());
            let pool: LockFreeRetryPool<&'static str, _> =
                LockFreeRetryPool::with_hooks(Arc::clone(&hooks));
            let dying = pool.obtain_lock("qwe");

            // Simulate a releaser that dropped the count to zero but didn't evict yet
            assert_eq!(Some(0), dying.decrease_references());

            let fresh = pool.obtain_lock("qwe");
            assert!(!Arc::ptr_eq(&dying, &fresh));
            assert_eq!(1, fresh.reference_count());
            assert_eq!(0, dying.reference_count());
            assert_eq!(vec!["qwe"], pool.lock_ids());
            assert_eq!(2, hooks.created.load(Ordering::SeqCst));
            assert_eq!(0, hooks.evicted.load(Ordering::SeqCst));

            // The late eviction of the dying lock must leave the fresh lock alone
            assert!(
                pool.locks
                    .remove_if("qwe", |_, published| Arc::ptr_eq(published, &dying))
                    .is_none()
            );
            assert!(Arc::ptr_eq(&fresh, &pool.obtain_lock("qwe")));
            assert_eq!(2, fresh.reference_count());
        }

        #[test]
        fn dead_locks_are_not_listed() {
            let pool = LockFreeRetryPool::new();
            let dying = pool.obtain_lock("qwe");
            let _other = pool.obtain_lock("asd");
            assert_eq!(Some(0), dying.decrease_references());

            // Still in the map, but not discoverable
            assert_eq!(2, pool.locks.len());
            assert_eq!(vec!["asd"], pool.lock_ids());
            assert_eq!(1, pool.lock_count());
        }

        #[test]
        fn republish_gives_up_if_slot_taken_by_other_lock() {
            let pool = LockFreeRetryPool::new();
            let dying = pool.obtain_lock("qwe");
            assert_eq!(Some(0), dying.decrease_references());
            let winner = Arc::new(crate::keyed_lock::KeyedLock::new("qwe", pool.id));
            pool.locks.insert("qwe", Arc::clone(&winner));

            assert!(pool._republish(&"qwe", &dying).is_none());
            assert!(Arc::ptr_eq(&winner, &pool.obtain_lock("qwe")));
            assert_eq!(2, winner.reference_count());
        }
    }
}

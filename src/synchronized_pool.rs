use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::KeyedLockError;
use super::hooks::{Hooks, NoopHooks};
use super::keyed_lock::KeyedLock;
use super::pool::{KeyedLockPool, PoolId};

/// A [KeyedLockPool] that protects its map with a single pool-wide mutex.
///
/// Obtaining and releasing locks is serialized across all ids, which makes every operation trivially atomic.
/// The pool-wide mutex is only held for the map update, never while a caller waits for a [KeyedLock],
/// so it is only a bottleneck if obtaining and releasing locks itself is the hot path.
/// Use [LockFreeRetryPool](crate::LockFreeRetryPool) if it is.
///
/// ```
/// use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, SynchronizedPool};
///
/// let pool = SynchronizedPool::new();
/// let guard1 = pool.lock(4);
/// let guard2 = pool.lock(5);
///
/// // After dropping the corresponding guard, the entry is removed from the pool
/// std::mem::drop(guard1);
/// assert_eq!(vec![5], pool.lock_ids());
/// ```
pub struct SynchronizedPool<K, H = NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    id: PoolId,

    // We never hand out a &mut to the map, and every KeyedLock reachable from it has a positive
    // reference count. Reference counts of published locks only change while this mutex is held,
    // so under the mutex the map and the counts are always consistent.
    locks: Mutex<HashMap<K, Arc<KeyedLock<K>>>>,

    hooks: H,
}

impl<K> SynchronizedPool<K, NoopHooks>
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

impl<K> Default for SynchronizedPool<K, NoopHooks>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H> SynchronizedPool<K, H>
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
            locks: Mutex::new(HashMap::with_capacity(capacity)),
            hooks,
        }
    }

    #[inline]
    fn _locks(&self) -> MutexGuard<'_, HashMap<K, Arc<KeyedLock<K>>>> {
        self.locks
            .lock()
            .expect("The global mutex protecting the SynchronizedPool is poisoned. This shouldn't happen since there shouldn't be any user code running while this lock is held so no thread should ever panic with it")
    }

    #[cfg(feature = "slow_assertions")]
    fn _assert_invariants(&self, locks: &HashMap<K, Arc<KeyedLock<K>>>) {
        for (id, lock) in locks {
            assert_eq!(id, lock.id(), "Lock is stored under the wrong id");
            assert!(
                lock.reference_count() > 0,
                "Lock for {:?} is published without references",
                id,
            );
        }
    }
}

impl<K, H> KeyedLockPool<K> for SynchronizedPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    fn lock_ids(&self) -> Vec<K> {
        self._locks().keys().cloned().collect()
    }

    fn lock_count(&self) -> usize {
        self._locks().len()
    }

    fn obtain_lock(&self, id: K) -> Arc<KeyedLock<K>> {
        let (lock, created) = {
            let mut locks = self._locks();
            let result = match locks.entry(id) {
                Entry::Occupied(entry) => {
                    let lock = Arc::clone(entry.get());
                    lock.increase_references();
                    (lock, false)
                }
                Entry::Vacant(entry) => {
                    let lock = Arc::new(KeyedLock::new(entry.key().clone(), self.id));
                    entry.insert(Arc::clone(&lock));
                    (lock, true)
                }
            };
            #[cfg(feature = "slow_assertions")]
            self._assert_invariants(&locks);
            result
        };

        if created {
            tracing::trace!(pool = %self.id, id = ?lock.id(), "Created lock");
            self.hooks.on_create(lock.id());
        }
        lock
    }

    fn release_lock(&self, lock: &KeyedLock<K>) -> Result<(), KeyedLockError> {
        if lock.owner() != self.id {
            return Err(KeyedLockError::ForeignLock);
        }

        let evicted = {
            let mut locks = self._locks();
            let remaining = lock
                .decrease_references()
                .ok_or(KeyedLockError::NotReferenced)?;
            // Nobody could have increased the count between our decrement and now since we hold the mutex.
            let evicted = (remaining == 0).then(|| locks.remove(lock.id()));
            #[cfg(feature = "slow_assertions")]
            self._assert_invariants(&locks);
            evicted
        };

        if let Some(removed) = evicted {
            // Checked after the mutex is released so a failure can't poison the pool
            debug_assert!(
                removed.is_some_and(|removed| std::ptr::eq(&*removed, lock)),
                "The lock we just released must be the one published for its id",
            );
            self.hooks.on_last_release(lock.id());
            tracing::trace!(pool = %self.id, id = ?lock.id(), "Evicted lock");
            self.hooks.on_evict(lock.id());
        }
        Ok(())
    }
}

impl<K, H> Debug for SynchronizedPool<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Hooks<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedPool")
            .field("id", &self.id)
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SynchronizedPool;
    crate::instantiate_pool_tests!(SynchronizedPool);

    mod panics {
        use super::SynchronizedPool;
        use crate::{Hooks, KeyedLockPool};
        use std::panic::{self, AssertUnwindSafe};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct PanicOnLastRelease {
            armed: AtomicBool,
        }
        impl<K> Hooks<K> for Arc<PanicOnLastRelease> {
            fn on_last_release(&self, _id: &K) {
                if self.armed.swap(false, Ordering::SeqCst) {
                    panic!("Hook failed");
                }
            }
        }

        #[test]
        fn panic_during_eviction_doesnt_poison_pool() {
            let hooks = Arc::new(PanicOnLastRelease {
                armed: AtomicBool::new(true),
            });
            let pool: SynchronizedPool<&'static str, _> = SynchronizedPool::with_hooks(hooks);
            let lock = pool.obtain_lock("qwe");

            let result = panic::catch_unwind(AssertUnwindSafe(|| pool.release_lock(&lock)));
            assert!(result.is_err());

            // The eviction itself happened before the panic, and the map mutex is still usable
            assert_eq!(0, lock.reference_count());
            assert_eq!(0, pool.lock_count());
            let fresh = pool.obtain_lock("qwe");
            assert!(!Arc::ptr_eq(&lock, &fresh));
            assert_eq!(Ok(()), pool.release_lock(&fresh));
            assert!(pool.lock_ids().is_empty());
        }
    }
}

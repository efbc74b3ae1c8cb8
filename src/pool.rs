use derive_more::Display;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::KeyedLockError;
use super::guard::{KeyedLockGuard, ObtainedLock};
use super::keyed_lock::KeyedLock;
use super::lock_free_pool::LockFreeRetryPool;
#[cfg(feature = "optimistic")]
use super::optimistic_pool::OptimisticPool;
use super::synchronized_pool::SynchronizedPool;

/// Process-unique identity of a pool. Locks remember the pool that created them
/// so that a pool can reject locks it didn't hand out.
#[derive(Debug, Display, PartialEq, Eq, Hash, Clone, Copy)]
#[display("pool#{_0}")]
pub(crate) struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A pool of locks that can be obtained by id.
///
/// All callers obtaining a lock for equal ids share one [KeyedLock] while at least one of them holds
/// an outstanding reference, and callers with different ids get independent locks. Entries are created
/// on demand and removed again once their last reference is released, so the pool only ever holds
/// entries for ids that are currently in use.
///
/// The methods of this trait are the low level contract: every [KeyedLockPool::obtain_lock] must be matched
/// by exactly one [KeyedLockPool::release_lock]. Most code should use the RAII wrappers from [KeyedLockPoolExt]
/// instead, which can't get this wrong.
///
/// There are several implementations with different tradeoffs:
/// - [SynchronizedPool] guards its map with a single mutex. Simple, but serializes all ids while obtaining or releasing.
/// - [LockFreeRetryPool] uses a concurrent map and compare-and-swap reference counting. Scales to many threads.
/// - `OptimisticPool` is unsound under contention and only exists for comparison.
pub trait KeyedLockPool<K> {
    /// Return the ids that currently have outstanding references.
    /// This is a snapshot, it can already be outdated when it is returned.
    fn lock_ids(&self) -> Vec<K>;

    /// Return the number of ids that currently have outstanding references.
    /// This is a snapshot, it can already be outdated when it is returned.
    fn lock_count(&self) -> usize;

    /// Obtain the lock for the given id and add a reference to it.
    ///
    /// If another reference for an equal id is outstanding, the same instance is returned. Otherwise,
    /// a fresh instance is created. Either way, [KeyedLock::reference_count] already accounts for
    /// this call when this returns.
    fn obtain_lock(&self, id: K) -> Arc<KeyedLock<K>>;

    /// Remove a reference from a lock previously returned by [KeyedLockPool::obtain_lock].
    /// If that was the last reference, the entry is removed from the pool and the next
    /// [KeyedLockPool::obtain_lock] for its id creates a fresh instance.
    ///
    /// Errors
    /// -----
    /// - [KeyedLockError::ForeignLock] if the lock was obtained from a different pool
    /// - [KeyedLockError::NotReferenced] if the lock doesn't have outstanding references
    ///
    /// The pool isn't modified in either case.
    fn release_lock(&self, lock: &KeyedLock<K>) -> Result<(), KeyedLockError>;
}

/// RAII wrappers around [KeyedLockPool]. This is implemented for all pools, including `dyn KeyedLockPool`.
///
/// ```
/// use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, LockFreeRetryPool};
///
/// let pool = LockFreeRetryPool::new();
/// let guard1 = pool.lock("a");
/// let guard2 = pool.lock("b");
/// assert_eq!(2, pool.lock_count());
///
/// // After unlocking, the entry is gone again
/// guard1.unlock()?;
/// assert_eq!(vec!["b"], pool.lock_ids());
/// # Ok::<(), keyed_locks::KeyedLockError>(())
/// ```
pub trait KeyedLockPoolExt<K>: KeyedLockPool<K> {
    /// Obtain a reference to the lock for `id` without locking it yet.
    /// The reference is released when the returned [ObtainedLock] (or the guard created from it) is dropped.
    #[inline]
    fn obtain(&self, id: K) -> ObtainedLock<K, Self, &Self> {
        ObtainedLock::obtain(self, id)
    }

    /// Like [KeyedLockPoolExt::obtain], but the returned [ObtainedLock] keeps the pool alive through an [Arc]
    /// instead of borrowing it, so it can be moved around more freely.
    #[inline]
    fn obtain_owned(self: &Arc<Self>, id: K) -> ObtainedLock<K, Self, Arc<Self>> {
        ObtainedLock::obtain(Arc::clone(self), id)
    }

    /// Lock the given id and return a guard for it.
    ///
    /// If the lock is held by a different thread, this blocks until it becomes available.
    /// The lock is reentrant: if the current thread already holds it, this returns immediately.
    /// When the guard is dropped, the lock is unlocked and the reference released.
    ///
    /// ```
    /// use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, SynchronizedPool};
    ///
    /// let pool = SynchronizedPool::new();
    /// let guard1 = pool.lock(4);
    /// // Reentrant, this doesn't deadlock
    /// let guard2 = pool.lock(4);
    /// assert_eq!(2, guard2.reference_count());
    ///
    /// std::mem::drop(guard1);
    /// std::mem::drop(guard2);
    /// assert_eq!(0, pool.lock_count());
    /// ```
    #[inline]
    fn lock(&self, id: K) -> KeyedLockGuard<K, Self, &Self> {
        self.obtain(id).lock()
    }

    /// Like [KeyedLockPoolExt::lock], but returns a guard that owns an [Arc] of the pool.
    #[inline]
    fn lock_owned(self: &Arc<Self>, id: K) -> KeyedLockGuard<K, Self, Arc<Self>> {
        self.obtain_owned(id).lock()
    }

    /// Attempts to lock the given id without blocking.
    /// If it is held by a different thread, [None] is returned and the reference obtained for the attempt is released again.
    #[inline]
    fn try_lock(&self, id: K) -> Option<KeyedLockGuard<K, Self, &Self>> {
        self.obtain(id).try_lock().ok()
    }

    /// Like [KeyedLockPoolExt::try_lock], but returns a guard that owns an [Arc] of the pool.
    #[inline]
    fn try_lock_owned(self: &Arc<Self>, id: K) -> Option<KeyedLockGuard<K, Self, Arc<Self>>> {
        self.obtain_owned(id).try_lock().ok()
    }
}

impl<K, P> KeyedLockPoolExt<K> for P where P: KeyedLockPool<K> + ?Sized {}

/// The pool implementations to choose from at runtime.
#[derive(Debug, Display, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Strategy {
    /// See [SynchronizedPool]
    Synchronized,
    /// See [LockFreeRetryPool]
    #[default]
    LockFreeRetry,
    /// See `OptimisticPool`. Not safe under contention.
    #[cfg(feature = "optimistic")]
    Optimistic,
}

impl Strategy {
    /// Create an empty pool using this strategy.
    ///
    /// ```
    /// use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, Strategy};
    ///
    /// let pool = Strategy::Synchronized.build();
    /// let guard = pool.lock(String::from("qwe"));
    /// assert_eq!(1, pool.lock_count());
    /// ```
    pub fn build<K>(self) -> Box<dyn KeyedLockPool<K> + Send + Sync>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    {
        match self {
            Strategy::Synchronized => Box::new(SynchronizedPool::new()),
            Strategy::LockFreeRetry => Box::new(LockFreeRetryPool::new()),
            #[cfg(feature = "optimistic")]
            Strategy::Optimistic => Box::new(OptimisticPool::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_ids_are_unique() {
        let first = PoolId::next();
        let second = PoolId::next();
        assert_ne!(first, second);
    }

    #[test]
    fn default_strategy_is_lock_free() {
        assert_eq!(Strategy::LockFreeRetry, Strategy::default());
        assert_eq!("LockFreeRetry", Strategy::default().to_string());
    }

    fn check_strategy(strategy: Strategy) {
        let pool = strategy.build::<&'static str>();
        {
            let guard = pool.lock("qwe");
            assert_eq!(&"qwe", guard.id());
            assert_eq!(vec!["qwe"], pool.lock_ids());
        }
        assert_eq!(0, pool.lock_count());
    }

    #[test]
    fn build_synchronized() {
        check_strategy(Strategy::Synchronized);
    }

    #[test]
    fn build_lock_free_retry() {
        check_strategy(Strategy::LockFreeRetry);
    }

    #[cfg(feature = "optimistic")]
    #[test]
    fn build_optimistic() {
        check_strategy(Strategy::Optimistic);
    }

    #[test]
    fn boxed_pool_can_be_shared_between_threads() {
        let pool: Arc<dyn KeyedLockPool<u32> + Send + Sync> =
            Arc::from(Strategy::LockFreeRetry.build::<u32>());
        let threads: Vec<_> = (0..4)
            .map(|id| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let _guard = pool.lock_owned(id);
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(0, pool.lock_count());
    }
}

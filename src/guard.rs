use std::borrow::Borrow;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use super::error::KeyedLockError;
use super::keyed_lock::{KeyedLock, KeyedMutexGuard};
use super::pool::KeyedLockPool;

/// A reference to the lock for an id, obtained from a [KeyedLockPool] but not locked yet.
///
/// While this exists, the pool keeps the entry for its id, and any other caller obtaining the same id gets the same lock.
/// Call [ObtainedLock::lock] to lock it. Dropping it without locking releases the reference.
#[must_use = "if unused the reference will immediately be released"]
pub struct ObtainedLock<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    // Invariant: Is always Some unless it was released or handed over to a guard
    inner: Option<(S, Arc<KeyedLock<K>>)>,
    _pool: PhantomData<fn() -> Box<P>>,
}

impl<K, P, S> ObtainedLock<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    pub(crate) fn obtain(pool: S, id: K) -> Self {
        let lock = pool.borrow().obtain_lock(id);
        Self {
            inner: Some((pool, lock)),
            _pool: PhantomData,
        }
    }

    #[inline]
    fn _lock(&self) -> &Arc<KeyedLock<K>> {
        let (_pool, lock) = self
            .inner
            .as_ref()
            .expect("The self.inner field must always be set unless this was already released");
        lock
    }

    #[inline]
    fn _take(&mut self) -> (S, Arc<KeyedLock<K>>) {
        self.inner
            .take()
            .expect("The self.inner field must always be set unless this was already released")
    }

    /// The id this lock was obtained for.
    #[inline]
    pub fn id(&self) -> &K {
        self._lock().id()
    }

    /// Snapshot of the number of outstanding references to this lock, including this one.
    #[inline]
    pub fn reference_count(&self) -> usize {
        self._lock().reference_count()
    }

    /// The [KeyedLock] shared by everyone who obtained this id.
    #[inline]
    pub fn keyed_lock(&self) -> &Arc<KeyedLock<K>> {
        self._lock()
    }

    /// Lock the mutex, blocking the current thread until it is available.
    /// If the current thread already holds it through another guard, this returns immediately.
    ///
    /// The returned guard unlocks the mutex and then releases the reference when it is dropped.
    pub fn lock(mut self) -> KeyedLockGuard<K, P, S> {
        let (pool, lock) = self._take();
        let guard = lock.lock_mutex();
        KeyedLockGuard::new(pool, lock, guard)
    }

    /// Try to lock the mutex without blocking. If it is held by a different thread,
    /// `self` is returned unchanged in the [Err] so the caller can retry or drop it.
    pub fn try_lock(mut self) -> Result<KeyedLockGuard<K, P, S>, Self> {
        let Some(guard) = self._lock().try_lock_mutex() else {
            return Err(self);
        };
        let (pool, lock) = self._take();
        Ok(KeyedLockGuard::new(pool, lock, guard))
    }

    /// Release the reference without ever locking.
    /// Dropping does the same, but this reports errors instead of only logging them.
    pub fn release(mut self) -> Result<(), KeyedLockError> {
        let (pool, lock) = self._take();
        pool.borrow().release_lock(&lock)
    }
}

impl<K, P, S> Drop for ObtainedLock<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    fn drop(&mut self) {
        if let Some((pool, lock)) = self.inner.take() {
            if let Err(error) = pool.borrow().release_lock(&lock) {
                tracing::warn!(%error, "Failed to release a lock that was never locked");
            }
        }
    }
}

impl<K, P, S> Debug for ObtainedLock<K, P, S>
where
    K: Debug,
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some((_pool, lock)) => write!(f, "ObtainedLock({:?})", lock.id()),
            None => write!(f, "ObtainedLock(released)"),
        }
    }
}

/// A RAII implementation of a scoped lock for an id of a [KeyedLockPool]. When this instance is dropped (falls out of scope),
/// the lock will be unlocked and the reference to it released, which removes the entry from the pool if nobody else references it.
///
/// Guards can't be sent to other threads, a lock must be unlocked on the thread that locked it.
#[must_use = "if unused the lock will immediately be unlocked"]
pub struct KeyedLockGuard<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    pool: S,
    // Invariant: Both are always Some unless in the middle of destruction
    lock: Option<Arc<KeyedLock<K>>>,
    guard: Option<KeyedMutexGuard>,
    _pool: PhantomData<fn() -> Box<P>>,
}

impl<K, P, S> KeyedLockGuard<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    fn new(pool: S, lock: Arc<KeyedLock<K>>, guard: KeyedMutexGuard) -> Self {
        Self {
            pool,
            lock: Some(lock),
            guard: Some(guard),
            _pool: PhantomData,
        }
    }

    #[inline]
    fn _lock(&self) -> &Arc<KeyedLock<K>> {
        self.lock
            .as_ref()
            .expect("The self.lock field must always be set unless this was already destructed")
    }

    /// The id this lock was obtained for.
    #[inline]
    pub fn id(&self) -> &K {
        self._lock().id()
    }

    /// Snapshot of the number of outstanding references to this lock, including this one.
    #[inline]
    pub fn reference_count(&self) -> usize {
        self._lock().reference_count()
    }

    /// The [KeyedLock] shared by everyone who obtained this id.
    #[inline]
    pub fn keyed_lock(&self) -> &Arc<KeyedLock<K>> {
        self._lock()
    }

    /// Unlock the mutex and then release the reference.
    /// Dropping the guard does the same, but this reports errors instead of only logging them.
    #[inline]
    pub fn unlock(mut self) -> Result<(), KeyedLockError> {
        self._unlock()
    }

    fn _unlock(&mut self) -> Result<(), KeyedLockError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        // Unlock first. Once the reference is released, the entry may be evicted
        // and somebody else may already be working with a fresh lock for this id.
        std::mem::drop(self.guard.take());
        self.pool.borrow().release_lock(&lock)
    }
}

impl<K, P, S> Drop for KeyedLockGuard<K, P, S>
where
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    fn drop(&mut self) {
        if let Err(error) = self._unlock() {
            tracing::warn!(%error, "Failed to release a lock after unlocking it");
        }
    }
}

impl<K, P, S> Debug for KeyedLockGuard<K, P, S>
where
    K: Debug,
    P: KeyedLockPool<K> + ?Sized,
    S: Borrow<P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lock {
            Some(lock) => write!(f, "KeyedLockGuard({:?})", lock.id()),
            None => write!(f, "KeyedLockGuard(unlocked)"),
        }
    }
}

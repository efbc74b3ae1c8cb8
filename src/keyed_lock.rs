use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::pool::PoolId;

pub(crate) type KeyedMutexGuard = lock_api::ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>;

/// The lock a [KeyedLockPool](crate::KeyedLockPool) hands out for one id.
///
/// A [KeyedLock] carries a reentrant mutex and a count of the outstanding
/// [obtain_lock](crate::KeyedLockPool::obtain_lock) calls that haven't been matched by a
/// [release_lock](crate::KeyedLockPool::release_lock) yet. The pool keeps it discoverable while
/// that count is positive. Once it drops to zero, the instance is dead and will never be handed out again;
/// the next caller for the same id gets a fresh instance.
pub struct KeyedLock<K> {
    id: K,
    owner: PoolId,
    // Behind its own Arc so that guards can own a lock on it without borrowing from the KeyedLock.
    mutex: Arc<ReentrantMutex<()>>,
    references: AtomicUsize,
}

impl<K> KeyedLock<K> {
    /// Create a lock that is referenced once, by the obtain call creating it.
    /// It must not be published before this is done, so nobody can ever observe an unreferenced fresh instance.
    #[inline]
    pub(crate) fn new(id: K, owner: PoolId) -> Self {
        Self {
            id,
            owner,
            mutex: Arc::new(ReentrantMutex::new(())),
            references: AtomicUsize::new(1),
        }
    }

    /// The id this lock was obtained for.
    #[inline]
    pub fn id(&self) -> &K {
        &self.id
    }

    /// Snapshot of the number of outstanding references. This is only meant for diagnostics,
    /// the value may already be outdated when it is returned.
    #[inline]
    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Whether any thread currently holds the mutex of this lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    #[inline]
    pub(crate) fn owner(&self) -> PoolId {
        self.owner
    }

    /// Blocks until the mutex is acquired. Reentrant: a thread already holding it gets another guard immediately.
    #[inline]
    pub(crate) fn lock_mutex(&self) -> KeyedMutexGuard {
        self.mutex.lock_arc()
    }

    #[inline]
    pub(crate) fn try_lock_mutex(&self) -> Option<KeyedMutexGuard> {
        self.mutex.try_lock_arc()
    }

    /// Unconditionally add a reference and return the resulting count.
    /// This can revive a dead instance, so it is only safe when the caller excludes concurrent releases.
    #[inline]
    pub(crate) fn increase_references(&self) -> usize {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Add a reference unless the count already reached zero. Returns the resulting count,
    /// or [None] if the instance is dead (or in the middle of being evicted).
    #[inline]
    pub(crate) fn try_increase_references(&self) -> Option<usize> {
        self.references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 { None } else { Some(count + 1) }
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Remove a reference and return the resulting count. Never goes below zero,
    /// an instance without references returns [None] and stays untouched.
    #[inline]
    pub(crate) fn decrease_references(&self) -> Option<usize> {
        self.references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }
}

impl<K: Debug> Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock")
            .field("id", &self.id)
            .field("references", &self.reference_count())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_lock() -> KeyedLock<&'static str> {
        KeyedLock::new("qwe", PoolId::next())
    }

    #[test]
    fn new_lock_is_referenced_once() {
        let lock = new_lock();
        assert_eq!(&"qwe", lock.id());
        assert_eq!(1, lock.reference_count());
        assert!(!lock.is_locked());
    }

    #[test]
    fn increase_and_decrease_return_resulting_count() {
        let lock = new_lock();
        assert_eq!(2, lock.increase_references());
        assert_eq!(Some(3), lock.try_increase_references());
        assert_eq!(Some(2), lock.decrease_references());
        assert_eq!(Some(1), lock.decrease_references());
        assert_eq!(Some(0), lock.decrease_references());
    }

    #[test]
    fn decrease_never_goes_below_zero() {
        let lock = new_lock();
        assert_eq!(Some(0), lock.decrease_references());
        assert_eq!(None, lock.decrease_references());
        assert_eq!(0, lock.reference_count());
    }

    #[test]
    fn try_increase_doesnt_revive_dead_lock() {
        let lock = new_lock();
        assert_eq!(Some(0), lock.decrease_references());
        assert_eq!(None, lock.try_increase_references());
        assert_eq!(0, lock.reference_count());
    }

    #[test]
    fn increase_revives_dead_lock() {
        let lock = new_lock();
        assert_eq!(Some(0), lock.decrease_references());
        assert_eq!(1, lock.increase_references());
    }

    #[test]
    fn mutex_is_reentrant() {
        let lock = new_lock();
        let guard1 = lock.lock_mutex();
        let guard2 = lock.lock_mutex();
        assert!(lock.is_locked());
        drop(guard1);
        assert!(lock.is_locked());
        drop(guard2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn mutex_excludes_other_threads() {
        let lock = Arc::new(new_lock());
        let guard = lock.lock_mutex();
        let lock_clone = Arc::clone(&lock);
        let locked_elsewhere = thread::spawn(move || lock_clone.try_lock_mutex().is_some())
            .join()
            .unwrap();
        assert!(!locked_elsewhere);
        drop(guard);
        let lock_clone = Arc::clone(&lock);
        let locked_elsewhere = thread::spawn(move || lock_clone.try_lock_mutex().is_some())
            .join()
            .unwrap();
        assert!(locked_elsewhere);
    }

    #[test]
    fn debug_shows_state() {
        let lock = new_lock();
        assert_eq!(
            "KeyedLock { id: \"qwe\", references: 1, locked: false }",
            format!("{:?}", lock),
        );
    }
}

/// This trait can be implemented to define hooks into a [KeyedLockPool](crate::KeyedLockPool) to
/// execute certain callbacks when the lifecycle of a pool entry changes.
///
/// Hooks never run while the pool holds its internal map locks, so they may call back into the pool.
/// All methods default to doing nothing.
pub trait Hooks<K> {
    /// This gets executed after a fresh lock for `id` was published in the pool.
    fn on_create(&self, _id: &K) {}

    /// This gets executed when a release dropped the last outstanding reference for `id`.
    /// Depending on the pool, the entry may or may not already be removed at that point.
    fn on_last_release(&self, _id: &K) {}

    /// This gets executed after the entry for `id` was removed from the pool.
    fn on_evict(&self, _id: &K) {}
}

/// Hooks that don't do anything. This is the default for all pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;
impl<K> Hooks<K> for NoopHooks {}

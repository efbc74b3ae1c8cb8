use derive_more::{Display, Error};

/// This error is returned by [KeyedLockPool::release_lock](crate::KeyedLockPool::release_lock) if the lock passed in
/// cannot be released by that pool. In both cases the pool state is left untouched.
#[derive(Error, Display, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum KeyedLockError {
    /// The lock was handed out by a different pool.
    #[display("The lock was obtained from a different pool")]
    ForeignLock,

    /// The lock doesn't have any outstanding references left. It was either already released as often
    /// as it was obtained, or it was evicted from its pool.
    #[display("The lock doesn't have any outstanding references left to release")]
    NotReferenced,
}

//! This library offers a pool of locks that are obtained by id.
//! Callers using equal ids are serialized through one shared lock, callers using different ids proceed independently.
//! Locks are created when an id is first obtained and removed again once the last caller released them, so the pool
//! only ever holds entries for ids that are currently in use.
//!
//! ```
//! use keyed_locks::{KeyedLockPool, KeyedLockPoolExt, LockFreeRetryPool};
//!
//! let pool = LockFreeRetryPool::new();
//! let guard1 = pool.lock(4);
//! let guard2 = pool.lock(5);
//! assert_eq!(2, pool.lock_count());
//!
//! // Locks are reentrant, the current thread can lock `4` again without deadlocking
//! let guard3 = pool.lock(4);
//!
//! // After dropping all guards for an id, its entry is gone
//! std::mem::drop(guard1);
//! std::mem::drop(guard3);
//! assert_eq!(vec![5], pool.lock_ids());
//! ```
//!
//! You can use an arbitrary type to index locks by, as long as that type implements [Eq] + [Hash](std::hash::Hash) + [Clone] + [Debug](std::fmt::Debug).
//!
//! There are several [KeyedLockPool] implementations with different tradeoffs, see [SynchronizedPool] and [LockFreeRetryPool].
//! If the implementation is chosen at runtime, [Strategy::build] returns a boxed one.

#![deny(missing_docs)]

mod error;
mod guard;
mod hooks;
mod keyed_lock;
mod lock_free_pool;
#[cfg(feature = "optimistic")]
mod optimistic_pool;
mod pool;
mod synchronized_pool;


pub use error::KeyedLockError;
pub use guard::{KeyedLockGuard, ObtainedLock};
pub use hooks::{Hooks, NoopHooks};
pub use keyed_lock::KeyedLock;
pub use lock_free_pool::LockFreeRetryPool;
#[cfg(feature = "optimistic")]
pub use optimistic_pool::OptimisticPool;
pub use pool::{KeyedLockPool, KeyedLockPoolExt, Strategy};
pub use synchronized_pool::SynchronizedPool;

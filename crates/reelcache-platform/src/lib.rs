//! Platform primitives shared by the reelcache crates.
//!
//! # Synchronization
//!
//! Re-exports the [`parking_lot`] mutex. It does not poison, so a panic on a
//! writer thread never turns every later cache access into an error.
//!
//! # Background work
//!
//! [`ThreadPool`] runs blocking disk work (deferred index flushes, cache
//! directory scans) off the caller's thread.

mod pool;

pub use parking_lot::{Mutex, MutexGuard};
pub use pool::ThreadPool;

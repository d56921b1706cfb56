//! Concurrency primitives shared by the Unrelated OIDC client.
//!
//! Two things live here:
//! - [`mutex::Mutex`]: a re-entrant read/write lock with pluggable scheduling
//!   (FIFO, round-robin, priority, weighted), acquire timeouts, cancellation,
//!   and deadlock detection over a process-wide waiter graph.
//! - [`cache::TtlCache`]: a string-keyed map with per-entry expiry and lazy
//!   eviction.
//!
//! This crate intentionally knows **nothing** about OIDC; it is plain plumbing
//! so the client crate can serialise its ledgers and caches.

pub mod cache;
pub mod error;
pub mod mutex;

pub use cache::TtlCache;
pub use error::{Result, SyncError};
pub use mutex::{
    AcquireOptions, Backoff, DeadlockInfo, DeadlockStrategy, DependencyGraph, LockKind, Mutex,
    MutexEvent, MutexGuard, MutexOptions, SchedulingPolicy, WeightedAging,
};

//! Shared key-value store boundary.
//!
//! All cross-process coordination state (slot counters, the leader lock,
//! pending queues, pre-acquired flags) lives behind these traits. The
//! [`AtomicOps`] operations are each a single atomic round trip on the
//! backend; callers never emulate them with separate reads and writes.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
#[cfg(feature = "redis")]
mod scripts;
pub mod r#trait;

pub use in_memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisKvStore;
pub use r#trait::{AtomicOps, KvStore, ReconcileOutcome, Store, StoreError, ttl_secs};

//! Jobs handed from the pending queues to the external executor.
//!
//! ## Components
//!
//! - `PendingJob`: serialized record stored in a tenant's pending queue
//! - `JobQueue`: the executor's enqueue boundary
//! - `is_duplicate_submission`: narrow allow-list for "already submitted" errors
//! - `InMemoryJobQueue` / `RedisJobQueue`: test and production executors

pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod types;

pub use queue::{EnqueueError, InMemoryJobQueue, JobQueue, is_duplicate_submission};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use types::{JobKind, PendingJob};

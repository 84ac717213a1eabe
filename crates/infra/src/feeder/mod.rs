//! Leader-elected feeder moving jobs from per-tenant pending queues to the
//! external executor.
//!
//! ## Design
//!
//! - One active leader per deployment, held through a TTL lease that is
//!   refreshed during long scans as well as once per cycle
//! - Per-tenant FIFO; free capacity is read as a hint, every dispatch still
//!   reserves its slot atomically
//! - An entry is removed (by exact stored bytes) only after the executor
//!   accepted it or reported it as a duplicate, so a crash between enqueue
//!   and removal is repaired on the next cycle
//!
//! A stale leader that keeps scanning after its lease expired (pause, clock
//! skew) can still double-dispatch; the short lease and mid-scan refreshes
//! narrow that window but do not close it.

pub mod leader;
pub mod pending;
pub mod runner;

pub use leader::{LeaderLease, Role};
pub use pending::{PendingEntry, PendingQueue, PendingQueueError};
pub use runner::{CrawlFeeder, DispatchOutcome, FeedReport, FeederError, FeederHandle, FeederStats};

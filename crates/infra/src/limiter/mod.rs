//! Worker-side concurrency limiting.
//!
//! [`TenantSemaphore`] takes and returns slots on a tenant's shared counter.
//! While the store is unreachable a per-tenant [`CircuitBreaker`] routes new
//! acquisitions to an in-process counting map so one node can still
//! throttle itself.

pub mod circuit;
pub mod semaphore;

pub use circuit::{BreakerState, CircuitBreaker};
pub use semaphore::{Acquisition, TenantSemaphore};

//! `crawlgate-core` — identifiers and the error model shared by every crate.
//!
//! This crate contains **no I/O**; stores, queues and schedulers live in
//! `crawlgate-infra`.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, TenantId};

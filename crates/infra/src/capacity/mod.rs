//! Tenant capacity accounting.
//!
//! - `settings`: the read-only per-tenant settings boundary and its resolver
//! - `manager`: slot reservation, advisory capacity reads, pre-acquired flags
//! - `cleanup`: best-effort release status reporting

pub mod cleanup;
pub mod manager;
pub mod settings;

pub use cleanup::CleanupStatus;
pub use manager::{CapacityManager, JobSlot};
pub use settings::{
    SettingName, SettingsError, SettingsResolver, StaticSettingsProvider, TenantSettingsProvider,
};

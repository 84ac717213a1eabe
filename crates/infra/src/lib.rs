//! Infrastructure layer: shared store, tenant concurrency control, job feeding.

pub mod capacity;
pub mod config;
pub mod feeder;
pub mod jobs;
pub mod keys;
pub mod limiter;
pub mod store;
pub mod watchdog;


pub use capacity::{CapacityManager, CleanupStatus, StaticSettingsProvider, TenantSettingsProvider};
pub use config::{ConfigError, CrawlgateConfig};
pub use feeder::{CrawlFeeder, FeederHandle};
pub use limiter::{Acquisition, TenantSemaphore};
pub use store::{AtomicOps, InMemoryKvStore, KvStore, Store, StoreError};
pub use watchdog::{ActiveJobSource, SlotWatchdog};

//! Configuration loading and representation.
//!
//! Every value has a default and can be overridden through a `CRAWLGATE_*`
//! environment variable. Loading goes through a lookup function so tests can
//! feed values without touching the process environment.

use std::time::Duration;

use thiserror::Error;

/// Configuration error (bad value or inconsistent combination).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Connection settings for the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound for a single store round trip.
    pub op_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout: Duration::from_secs(2),
        }
    }
}

/// Worker-side semaphore settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreConfig {
    /// Distributed per-tenant limit; `<= 0` disables limiting.
    pub limit: i64,
    /// In-process limit used while the breaker is open; defaults to `limit`.
    pub local_limit: Option<u32>,
    pub slot_ttl: Duration,
    pub breaker_timeout: Duration,
}

impl SemaphoreConfig {
    pub fn effective_local_limit(&self) -> u32 {
        self.local_limit_for(self.limit)
    }

    /// Local limit for a tenant whose distributed limit is `tenant_limit`.
    pub fn local_limit_for(&self, tenant_limit: i64) -> u32 {
        self.local_limit
            .unwrap_or_else(|| u32::try_from(tenant_limit.max(0)).unwrap_or(u32::MAX))
    }
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            local_limit: None,
            slot_ttl: Duration::from_secs(2 * 60 * 60),
            breaker_timeout: Duration::from_secs(30),
        }
    }
}

/// Global defaults used when a tenant has no override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityDefaults {
    pub concurrency_limit: i64,
    pub slot_ttl: Duration,
    /// Upper bound for one settings-provider lookup.
    pub settings_timeout: Duration,
}

impl Default for CapacityDefaults {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            slot_ttl: Duration::from_secs(2 * 60 * 60),
            settings_timeout: Duration::from_millis(500),
        }
    }
}

/// Leader-elected feeder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeederConfig {
    /// Value stored in the leader lock; must be unique per process.
    pub owner_id: String,
    pub lease_ttl: Duration,
    /// How often the lease is refreshed, including in the middle of a scan.
    pub lease_refresh_interval: Duration,
    /// Sleep between cycles when the leader found nothing to dispatch.
    pub idle_interval: Duration,
    /// Sleep between leadership attempts while following.
    pub follower_interval: Duration,
    /// Upper bound on entries examined per tenant per cycle.
    pub max_batch_per_tenant: usize,
}

impl FeederConfig {
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(None),
            lease_ttl: Duration::from_secs(30),
            lease_refresh_interval: Duration::from_secs(10),
            idle_interval: Duration::from_secs(1),
            follower_interval: Duration::from_secs(5),
            max_batch_per_tenant: 50,
        }
    }
}

/// Slot watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Full configuration of one crawlgate process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlgateConfig {
    pub redis: RedisConfig,
    pub semaphore: SemaphoreConfig,
    pub capacity: CapacityDefaults,
    pub feeder: FeederConfig,
    pub watchdog: WatchdogConfig,
}

impl CrawlgateConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let defaults = Self::default();

        let concurrency_limit = env.int("CRAWLGATE_CONCURRENCY_LIMIT", defaults.capacity.concurrency_limit)?;
        let slot_ttl = env.secs("CRAWLGATE_SLOT_TTL_SECS", defaults.capacity.slot_ttl)?;

        let config = Self {
            redis: RedisConfig {
                url: env.string("CRAWLGATE_REDIS_URL").unwrap_or(defaults.redis.url),
                op_timeout: env.millis("CRAWLGATE_REDIS_OP_TIMEOUT_MS", defaults.redis.op_timeout)?,
            },
            semaphore: SemaphoreConfig {
                limit: concurrency_limit,
                local_limit: env.optional_u32("CRAWLGATE_LOCAL_LIMIT")?,
                slot_ttl,
                breaker_timeout: env.secs("CRAWLGATE_BREAKER_SECS", defaults.semaphore.breaker_timeout)?,
            },
            capacity: CapacityDefaults {
                concurrency_limit,
                slot_ttl,
                settings_timeout: env.millis(
                    "CRAWLGATE_SETTINGS_TIMEOUT_MS",
                    defaults.capacity.settings_timeout,
                )?,
            },
            feeder: FeederConfig {
                owner_id: env
                    .string("CRAWLGATE_FEEDER_OWNER_ID")
                    .unwrap_or_else(|| default_owner_id(env.string("HOSTNAME"))),
                lease_ttl: env.secs("CRAWLGATE_LEASE_TTL_SECS", defaults.feeder.lease_ttl)?,
                lease_refresh_interval: env.secs(
                    "CRAWLGATE_LEASE_REFRESH_SECS",
                    defaults.feeder.lease_refresh_interval,
                )?,
                idle_interval: env.millis("CRAWLGATE_IDLE_INTERVAL_MS", defaults.feeder.idle_interval)?,
                follower_interval: env.millis(
                    "CRAWLGATE_FOLLOWER_INTERVAL_MS",
                    defaults.feeder.follower_interval,
                )?,
                max_batch_per_tenant: env.usize(
                    "CRAWLGATE_MAX_BATCH_PER_TENANT",
                    defaults.feeder.max_batch_per_tenant,
                )?,
            },
            watchdog: WatchdogConfig {
                interval: env.secs("CRAWLGATE_WATCHDOG_INTERVAL_SECS", defaults.watchdog.interval)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that break the lease or slot invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feeder.lease_ttl.is_zero() {
            return Err(ConfigError::Inconsistent("lease TTL must be positive".to_string()));
        }
        if self.feeder.lease_refresh_interval >= self.feeder.lease_ttl {
            return Err(ConfigError::Inconsistent(format!(
                "lease refresh interval ({:?}) must be shorter than the lease TTL ({:?})",
                self.feeder.lease_refresh_interval, self.feeder.lease_ttl
            )));
        }
        if self.capacity.slot_ttl.is_zero() || self.semaphore.slot_ttl.is_zero() {
            return Err(ConfigError::Inconsistent("slot TTL must be positive".to_string()));
        }
        if self.feeder.max_batch_per_tenant == 0 {
            return Err(ConfigError::Inconsistent(
                "max batch per tenant must be at least 1".to_string(),
            ));
        }
        if self.feeder.owner_id.trim().is_empty() {
            return Err(ConfigError::Inconsistent("feeder owner id is empty".to_string()));
        }
        Ok(())
    }
}

fn default_owner_id(host: Option<String>) -> String {
    let host = host.unwrap_or_else(|| "feeder".to_string());
    format!("{host}:{}:{}", std::process::id(), uuid::Uuid::now_v7().simple())
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn int(&self, var: &'static str, default: i64) -> Result<i64, ConfigError> {
        Ok(self.parsed(var)?.unwrap_or(default))
    }

    fn usize(&self, var: &'static str, default: usize) -> Result<usize, ConfigError> {
        Ok(self.parsed(var)?.unwrap_or(default))
    }

    fn optional_u32(&self, var: &'static str) -> Result<Option<u32>, ConfigError> {
        self.parsed(var)
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.parsed::<u64>(var)?.map(Duration::from_secs).unwrap_or(default))
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.parsed::<u64>(var)?.map(Duration::from_millis).unwrap_or(default))
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use crawlgate_core::TenantId;
use parking_lot::Mutex;

use super::circuit::CircuitBreaker;
use crate::capacity::SettingsResolver;
use crate::config::SemaphoreConfig;
use crate::keys::active_jobs_key;
use crate::store::Store;

/// How a slot was obtained. Hand it back to [`TenantSemaphore::release`]
/// so the matching path is reversed.
#[must_use = "pass the acquisition back to TenantSemaphore::release"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Limiting is disabled; nothing to release.
    Unlimited,
    /// Slot taken on the shared counter; `slot` is the post-increment value.
    Distributed { slot: i64 },
    /// Slot taken in the in-process fallback map while the breaker was open.
    Local,
    /// No capacity left.
    Rejected,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Per-tenant distributed semaphore with a local fallback.
///
/// Store failures never reach the caller: an acquire that cannot talk to the
/// store trips the tenant's breaker and continues against the local map.
///
/// Limit and slot TTL come from `config` unless a [`SettingsResolver`] is
/// attached with [`Self::with_settings`]; attach the capacity manager's
/// resolver so both enforce the same per-tenant values on the shared counter.
pub struct TenantSemaphore<S: Store + ?Sized> {
    store: Arc<S>,
    config: SemaphoreConfig,
    settings: SettingsResolver,
    breaker: CircuitBreaker,
    local: Mutex<HashMap<TenantId, u32>>,
}

impl<S: Store + ?Sized> TenantSemaphore<S> {
    pub fn new(store: Arc<S>, config: SemaphoreConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_timeout);
        let settings = SettingsResolver::fixed(config.limit, config.slot_ttl);
        Self {
            store,
            config,
            settings,
            breaker,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: SettingsResolver) -> Self {
        self.settings = settings;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn config(&self) -> &SemaphoreConfig {
        &self.config
    }

    pub async fn acquire(&self, tenant_id: TenantId) -> Acquisition {
        let limit = self.settings.concurrency_limit(tenant_id).await;
        if limit <= 0 {
            return Acquisition::Unlimited;
        }

        if self.breaker.is_open(tenant_id) {
            return self.acquire_local(tenant_id, limit);
        }

        let key = active_jobs_key(tenant_id);
        let ttl = self.settings.slot_ttl(tenant_id).await;
        match self.store.acquire_slot(&key, limit, ttl).await {
            Ok(slot) if slot > 0 => Acquisition::Distributed { slot },
            Ok(_) => {
                tracing::debug!(tenant_id = %tenant_id, limit, "tenant at capacity");
                Acquisition::Rejected
            }
            Err(e) => {
                self.breaker.trip(tenant_id);
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    breaker_secs = self.breaker.timeout().as_secs(),
                    "store unavailable, falling back to local slot accounting"
                );
                self.acquire_local(tenant_id, limit)
            }
        }
    }

    /// Reverse `acquisition`.
    ///
    /// A distributed slot is always released on the store, whatever the
    /// breaker state; a failure re-opens the breaker and is only logged.
    pub async fn release(&self, tenant_id: TenantId, acquisition: Acquisition) {
        match acquisition {
            Acquisition::Unlimited | Acquisition::Rejected => {}
            Acquisition::Local => self.release_local(tenant_id),
            Acquisition::Distributed { .. } => {
                let key = active_jobs_key(tenant_id);
                let ttl = self.settings.slot_ttl(tenant_id).await;
                if let Err(e) = self.store.release_slot(&key, ttl).await {
                    self.breaker.trip(tenant_id);
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "failed to release distributed slot; it will expire with its TTL"
                    );
                }
            }
        }
    }

    /// Slots currently held in the local fallback map for `tenant_id`.
    pub fn local_in_use(&self, tenant_id: TenantId) -> u32 {
        self.local.lock().get(&tenant_id).copied().unwrap_or(0)
    }

    fn acquire_local(&self, tenant_id: TenantId, limit: i64) -> Acquisition {
        let local_limit = self.config.local_limit_for(limit);
        let mut local = self.local.lock();
        let in_use = local.entry(tenant_id).or_insert(0);
        if *in_use >= local_limit {
            tracing::debug!(tenant_id = %tenant_id, local_limit, "tenant at local capacity");
            return Acquisition::Rejected;
        }
        *in_use += 1;
        Acquisition::Local
    }

    fn release_local(&self, tenant_id: TenantId) {
        let mut local = self.local.lock();
        if let Some(in_use) = local.get_mut(&tenant_id) {
            *in_use = in_use.saturating_sub(1);
            if *in_use == 0 {
                local.remove(&tenant_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capacity::{SettingName, StaticSettingsProvider};
    use crate::store::{InMemoryKvStore, KvStore};

    fn semaphore(limit: i64, local_limit: Option<u32>) -> (Arc<InMemoryKvStore>, TenantSemaphore<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        let config = SemaphoreConfig {
            limit,
            local_limit,
            slot_ttl: Duration::from_secs(60),
            breaker_timeout: Duration::from_secs(30),
        };
        (store.clone(), TenantSemaphore::new(store, config))
    }

    #[tokio::test]
    async fn disabled_limit_is_unlimited_without_store_calls() {
        let (store, sem) = semaphore(0, None);
        let tenant = TenantId::new();

        for _ in 0..10 {
            assert_eq!(sem.acquire(tenant).await, Acquisition::Unlimited);
        }
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn limit_two_admits_two_then_rejects() {
        let (_store, sem) = semaphore(2, None);
        let tenant = TenantId::new();

        let first = sem.acquire(tenant).await;
        let second = sem.acquire(tenant).await;
        let third = sem.acquire(tenant).await;
        assert_eq!(first, Acquisition::Distributed { slot: 1 });
        assert_eq!(second, Acquisition::Distributed { slot: 2 });
        assert_eq!(third, Acquisition::Rejected);

        sem.release(tenant, first).await;
        assert!(sem.acquire(tenant).await.is_acquired());
    }

    #[tokio::test]
    async fn store_failure_trips_breaker_and_uses_local_limit() {
        let (store, sem) = semaphore(5, Some(2));
        let tenant = TenantId::new();
        store.set_unavailable(true);

        assert_eq!(sem.acquire(tenant).await, Acquisition::Local);
        assert!(sem.breaker().is_open(tenant));
        assert_eq!(sem.acquire(tenant).await, Acquisition::Local);
        assert_eq!(sem.acquire(tenant).await, Acquisition::Rejected);
        assert_eq!(sem.local_in_use(tenant), 2);
    }

    #[tokio::test]
    async fn local_release_never_touches_store() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();
        store.set_unavailable(true);

        let acquisition = sem.acquire(tenant).await;
        assert_eq!(acquisition, Acquisition::Local);

        store.set_unavailable(false);
        let calls = store.call_count();
        sem.release(tenant, acquisition).await;

        assert_eq!(store.call_count(), calls);
        assert_eq!(sem.local_in_use(tenant), 0);
    }

    #[tokio::test]
    async fn distributed_release_ignores_open_breaker() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();

        let acquisition = sem.acquire(tenant).await;
        assert!(matches!(acquisition, Acquisition::Distributed { .. }));

        sem.breaker().trip(tenant);
        sem.release(tenant, acquisition).await;

        assert_eq!(store.get(&active_jobs_key(tenant)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_distributed_release_reopens_breaker() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();

        let acquisition = sem.acquire(tenant).await;
        store.set_unavailable(true);
        sem.release(tenant, acquisition).await;

        assert!(sem.breaker().is_open(tenant));
    }

    #[tokio::test(start_paused = true)]
    async fn distributed_mode_resumes_after_breaker_timeout() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();

        store.set_unavailable(true);
        assert_eq!(sem.acquire(tenant).await, Acquisition::Local);
        store.set_unavailable(false);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(sem.acquire(tenant).await, Acquisition::Distributed { slot: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_overrides_apply_to_limit_and_ttl() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();
        let provider = StaticSettingsProvider::new()
            .with_override(tenant, SettingName::CrawlConcurrencyLimit, 1)
            .with_override(tenant, SettingName::SlotTtlSeconds, 600);
        let sem = sem.with_settings(SettingsResolver::new(
            Arc::new(provider),
            5,
            Duration::from_secs(60),
            Duration::from_millis(50),
        ));

        assert!(sem.acquire(tenant).await.is_acquired());
        assert_eq!(sem.acquire(tenant).await, Acquisition::Rejected);
        assert_eq!(
            store.expires_at(&active_jobs_key(tenant)),
            Some(tokio::time::Instant::now() + Duration::from_secs(600))
        );

        let other = TenantId::new();
        for _ in 0..5 {
            assert!(sem.acquire(other).await.is_acquired());
        }
        assert_eq!(sem.acquire(other).await, Acquisition::Rejected);
    }

    #[tokio::test]
    async fn local_fallback_follows_the_tenant_limit() {
        let (store, sem) = semaphore(5, None);
        let tenant = TenantId::new();
        let provider = StaticSettingsProvider::new().with_override(tenant, SettingName::CrawlConcurrencyLimit, 1);
        let sem = sem.with_settings(SettingsResolver::new(
            Arc::new(provider),
            5,
            Duration::from_secs(60),
            Duration::from_millis(50),
        ));
        store.set_unavailable(true);

        assert_eq!(sem.acquire(tenant).await, Acquisition::Local);
        assert_eq!(sem.acquire(tenant).await, Acquisition::Rejected);
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crawlgate_core::TenantId;
use thiserror::Error;

/// Tenant-tunable settings consumed by the capacity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingName {
    CrawlConcurrencyLimit,
    SlotTtlSeconds,
}

impl SettingName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrawlConcurrencyLimit => "crawl_concurrency_limit",
            Self::SlotTtlSeconds => "slot_ttl_seconds",
        }
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingName {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawl_concurrency_limit" => Ok(Self::CrawlConcurrencyLimit),
            "slot_ttl_seconds" => Ok(Self::SlotTtlSeconds),
            other => Err(SettingsError::UnknownSetting(other.to_string())),
        }
    }
}

/// Settings lookup failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownSetting(String),

    #[error("settings backend error: {0}")]
    Backend(String),

    #[error("invalid tenant overrides: {0}")]
    InvalidOverrides(String),
}

/// Read-only per-tenant settings lookup.
///
/// `Ok(None)` means "no override, use the global default".
#[async_trait]
pub trait TenantSettingsProvider: Send + Sync {
    async fn get_setting(
        &self,
        tenant_id: TenantId,
        name: SettingName,
    ) -> Result<Option<i64>, SettingsError>;
}

/// Fixed overrides supplied at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsProvider {
    overrides: HashMap<(TenantId, SettingName), i64>,
}

impl StaticSettingsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, tenant_id: TenantId, name: SettingName, value: i64) -> Self {
        self.overrides.insert((tenant_id, name), value);
        self
    }

    /// Parse `{"<tenant_id>": {"<setting_name>": <int>}}`.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let raw: HashMap<String, HashMap<String, i64>> =
            serde_json::from_str(json).map_err(|e| SettingsError::InvalidOverrides(e.to_string()))?;

        let mut provider = Self::new();
        for (tenant, settings) in raw {
            let tenant_id: TenantId = tenant
                .parse()
                .map_err(|e| SettingsError::InvalidOverrides(format!("{tenant}: {e}")))?;
            for (name, value) in settings {
                provider = provider.with_override(tenant_id, name.parse()?, value);
            }
        }
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[async_trait]
impl TenantSettingsProvider for StaticSettingsProvider {
    async fn get_setting(
        &self,
        tenant_id: TenantId,
        name: SettingName,
    ) -> Result<Option<i64>, SettingsError> {
        Ok(self.overrides.get(&(tenant_id, name)).copied())
    }
}

/// Effective per-tenant limit and slot TTL: the tenant override if present,
/// else the global default.
///
/// Shared by every component that touches `tenant:{id}:active_jobs`, so they
/// agree on the limit they enforce and the TTL they refresh. A slow or
/// failing provider never blocks longer than `timeout` and never raises.
#[derive(Clone)]
pub struct SettingsResolver {
    provider: Arc<dyn TenantSettingsProvider>,
    concurrency_limit: i64,
    slot_ttl: Duration,
    timeout: Duration,
}

impl SettingsResolver {
    pub fn new(
        provider: Arc<dyn TenantSettingsProvider>,
        concurrency_limit: i64,
        slot_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            concurrency_limit,
            slot_ttl,
            timeout,
        }
    }

    /// Global defaults only, no overrides.
    pub fn fixed(concurrency_limit: i64, slot_ttl: Duration) -> Self {
        Self::new(
            Arc::new(StaticSettingsProvider::new()),
            concurrency_limit,
            slot_ttl,
            Duration::from_millis(500),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn effective_setting(&self, tenant_id: TenantId, name: SettingName) -> i64 {
        let lookup = self.provider.get_setting(tenant_id, name);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Some(value))) => value,
            Ok(Ok(None)) => self.default_for(name),
            Ok(Err(e)) => {
                tracing::warn!(tenant_id = %tenant_id, setting = %name, error = %e, "settings lookup failed, using default");
                self.default_for(name)
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    setting = %name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "settings lookup timed out, using default"
                );
                self.default_for(name)
            }
        }
    }

    pub async fn concurrency_limit(&self, tenant_id: TenantId) -> i64 {
        self.effective_setting(tenant_id, SettingName::CrawlConcurrencyLimit)
            .await
    }

    /// Non-positive TTL overrides fall back to the default.
    pub async fn slot_ttl(&self, tenant_id: TenantId) -> Duration {
        let secs = self
            .effective_setting(tenant_id, SettingName::SlotTtlSeconds)
            .await;
        u64::try_from(secs)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.slot_ttl)
    }

    fn default_for(&self, name: SettingName) -> i64 {
        match name {
            SettingName::CrawlConcurrencyLimit => self.concurrency_limit,
            SettingName::SlotTtlSeconds => i64::try_from(self.slot_ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Debug for SettingsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsResolver")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("slot_ttl", &self.slot_ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_are_per_tenant() {
        let a = TenantId::new();
        let b = TenantId::new();
        let provider = StaticSettingsProvider::new().with_override(a, SettingName::CrawlConcurrencyLimit, 9);

        assert_eq!(
            provider.get_setting(a, SettingName::CrawlConcurrencyLimit).await,
            Ok(Some(9))
        );
        assert_eq!(provider.get_setting(b, SettingName::CrawlConcurrencyLimit).await, Ok(None));
        assert_eq!(provider.get_setting(a, SettingName::SlotTtlSeconds).await, Ok(None));
    }

    #[tokio::test]
    async fn parses_json_overrides() {
        let tenant = TenantId::new();
        let json = format!(r#"{{"{tenant}": {{"crawl_concurrency_limit": 3, "slot_ttl_seconds": 600}}}}"#);
        let provider = StaticSettingsProvider::from_json(&json).unwrap();

        assert_eq!(provider.len(), 2);
        assert_eq!(
            provider.get_setting(tenant, SettingName::SlotTtlSeconds).await,
            Ok(Some(600))
        );
    }

    #[tokio::test]
    async fn resolver_ignores_non_positive_ttl_overrides() {
        let tenant = TenantId::new();
        let provider = StaticSettingsProvider::new()
            .with_override(tenant, SettingName::SlotTtlSeconds, 0)
            .with_override(tenant, SettingName::CrawlConcurrencyLimit, 4);
        let resolver = SettingsResolver::new(Arc::new(provider), 2, Duration::from_secs(90), Duration::from_millis(50));

        assert_eq!(resolver.slot_ttl(tenant).await, Duration::from_secs(90));
        assert_eq!(resolver.concurrency_limit(tenant).await, 4);
        assert_eq!(resolver.concurrency_limit(TenantId::new()).await, 2);
    }

    #[test]
    fn rejects_unknown_setting_names() {
        let tenant = TenantId::new();
        let json = format!(r#"{{"{tenant}": {{"max_pages": 3}}}}"#);
        assert_eq!(
            StaticSettingsProvider::from_json(&json).unwrap_err(),
            SettingsError::UnknownSetting("max_pages".to_string())
        );
    }

    #[test]
    fn rejects_malformed_tenant_ids() {
        let err = StaticSettingsProvider::from_json(r#"{"acme": {"slot_ttl_seconds": 1}}"#).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidOverrides(_)));
    }
}

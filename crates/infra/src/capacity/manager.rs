use std::sync::Arc;
use std::time::Duration;

use crawlgate_core::{JobId, TenantId};

use super::cleanup::{CleanupStatus, best_effort};
use super::settings::{SettingName, SettingsResolver, TenantSettingsProvider};
use crate::config::CapacityDefaults;
use crate::keys::{active_jobs_key, slot_preacquired_key};
use crate::store::{Store, StoreError};

/// Result of reserving a slot on behalf of one job.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSlot {
    /// The tenant is at its limit; nothing was reserved.
    AtCapacity,
    /// A slot was reserved. `flag_created` is false when a pre-acquired flag
    /// for the job already existed, i.e. an earlier attempt still owns it.
    Reserved { flag_created: bool },
}

impl JobSlot {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

/// Per-tenant capacity accounting on top of the shared store.
///
/// Resolves effective settings through an injected read-only
/// [`TenantSettingsProvider`], reserves slots with the atomic acquire script
/// and tracks which tenant a pre-acquired slot belongs to so any process can
/// release it later.
///
/// The pre-acquired flag doubles as the release token: cleanup paths claim
/// it with an atomic read-and-delete and only the claimant gives the slot
/// back, so concurrent cleanups of one job release at most one slot.
pub struct CapacityManager<S: Store + ?Sized> {
    store: Arc<S>,
    settings: SettingsResolver,
}

impl<S: Store + ?Sized> CapacityManager<S> {
    pub fn new(
        store: Arc<S>,
        settings: Arc<dyn TenantSettingsProvider>,
        defaults: CapacityDefaults,
    ) -> Self {
        let settings = SettingsResolver::new(
            settings,
            defaults.concurrency_limit,
            defaults.slot_ttl,
            defaults.settings_timeout,
        );
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The resolver used for limits and TTLs; share it with any
    /// [`crate::limiter::TenantSemaphore`] guarding the same counters.
    pub fn settings(&self) -> &SettingsResolver {
        &self.settings
    }

    /// Tenant override if present, else the global default.
    ///
    /// A slow or failing provider never blocks longer than the settings
    /// timeout and never raises; the default is used instead.
    pub async fn effective_setting(&self, tenant_id: TenantId, name: SettingName) -> i64 {
        self.settings.effective_setting(tenant_id, name).await
    }

    pub async fn concurrency_limit(&self, tenant_id: TenantId) -> i64 {
        self.settings.concurrency_limit(tenant_id).await
    }

    /// Slot TTL for `tenant_id`; non-positive overrides fall back to the default.
    pub async fn slot_ttl(&self, tenant_id: TenantId) -> Duration {
        self.settings.slot_ttl(tenant_id).await
    }

    /// Reserve one slot. `Ok(false)` means the tenant is at capacity.
    pub async fn try_acquire_slot(&self, tenant_id: TenantId) -> Result<bool, StoreError> {
        let limit = self.concurrency_limit(tenant_id).await;
        let ttl = self.slot_ttl(tenant_id).await;
        let slot = self
            .store
            .acquire_slot(&active_jobs_key(tenant_id), limit, ttl)
            .await?;

        if slot == 0 {
            tracing::debug!(tenant_id = %tenant_id, limit, "tenant at capacity");
            return Ok(false);
        }
        Ok(true)
    }

    /// Reserve one slot for `job_id` and record the pre-acquired flag.
    ///
    /// An existing flag is never overwritten. If the flag cannot be written
    /// the slot is released again before the error is returned, so it is
    /// never left without an owner.
    pub async fn acquire_slot_for_job(
        &self,
        job_id: JobId,
        tenant_id: TenantId,
    ) -> Result<JobSlot, StoreError> {
        if !self.try_acquire_slot(tenant_id).await? {
            return Ok(JobSlot::AtCapacity);
        }

        match self.mark_slot_preacquired(job_id, tenant_id).await {
            Ok(flag_created) => Ok(JobSlot::Reserved { flag_created }),
            Err(e) => {
                tracing::warn!(job_id = %job_id, tenant_id = %tenant_id, error = %e, "failed to record pre-acquired slot, releasing it");
                let _ = best_effort("release_slot", self.release_slot(tenant_id)).await;
                Err(e)
            }
        }
    }

    /// Advisory `limit - active`, clamped to `[0, limit]`.
    ///
    /// Never use this to reserve capacity: the counter can move between this
    /// read and the next acquire. Unlimited tenants report `i64::MAX`.
    pub async fn get_available_capacity(&self, tenant_id: TenantId) -> Result<i64, StoreError> {
        let limit = self.concurrency_limit(tenant_id).await;
        if limit <= 0 {
            return Ok(i64::MAX);
        }

        let active = match self.store.get(&active_jobs_key(tenant_id)).await? {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                StoreError::UnexpectedReply(format!("non-numeric slot counter {raw:?}"))
            })?,
        };
        Ok((limit - active).clamp(0, limit))
    }

    /// Give back one slot held by `tenant_id`; returns the remaining count.
    pub async fn release_slot(&self, tenant_id: TenantId) -> Result<i64, StoreError> {
        let ttl = self.slot_ttl(tenant_id).await;
        self.store
            .release_slot(&active_jobs_key(tenant_id), ttl)
            .await
    }

    /// Bind `job_id` to the tenant whose slot it consumed. Call only after a
    /// successful acquire. Returns `false` when a flag already existed; it is
    /// left untouched.
    pub async fn mark_slot_preacquired(
        &self,
        job_id: JobId,
        tenant_id: TenantId,
    ) -> Result<bool, StoreError> {
        let ttl = self.slot_ttl(tenant_id).await;
        self.store
            .set_if_absent(&slot_preacquired_key(job_id), &tenant_id.to_string(), ttl)
            .await
    }

    pub async fn get_preacquired_tenant(&self, job_id: JobId) -> Result<Option<TenantId>, StoreError> {
        let raw = self.store.get(&slot_preacquired_key(job_id)).await?;
        parse_flag(job_id, raw)
    }

    /// Idempotent; returns whether a flag was present.
    pub async fn clear_preacquired_flag(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.store.delete(&slot_preacquired_key(job_id)).await
    }

    /// Atomically read and delete the flag. Whoever gets `Some` owns the
    /// release of that slot.
    async fn claim_preacquired_tenant(&self, job_id: JobId) -> Result<Option<TenantId>, StoreError> {
        let raw = self.store.take(&slot_preacquired_key(job_id)).await?;
        parse_flag(job_id, raw)
    }

    /// Release the slot behind a claimed flag. On failure the flag is put
    /// back so a later cleanup can retry.
    async fn release_claimed(&self, job_id: JobId, tenant_id: TenantId) -> Result<(), String> {
        if let Err(reason) = best_effort("release_slot", self.release_slot(tenant_id)).await {
            let _ = best_effort("restore_preacquired_flag", self.mark_slot_preacquired(job_id, tenant_id)).await;
            return Err(reason);
        }
        Ok(())
    }

    /// Last-resort recovery when a job's tenant could not be determined.
    ///
    /// Claims the pre-acquired flag and releases that tenant's slot. Returns
    /// `false` when there was nothing to recover (another path got there
    /// first) or the recovery itself failed; in that case the slot is held
    /// until its TTL.
    pub async fn emergency_release_slot(&self, job_id: JobId) -> bool {
        let tenant_id = match self.claim_preacquired_tenant(job_id).await {
            Ok(Some(tenant_id)) => tenant_id,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "emergency release: no pre-acquired flag");
                return false;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "emergency release failed to claim pre-acquired flag; slot held until TTL");
                return false;
            }
        };

        if let Err(reason) = self.release_claimed(job_id, tenant_id).await {
            tracing::error!(job_id = %job_id, tenant_id = %tenant_id, reason = %reason, "emergency release failed; slot held until TTL");
            return false;
        }

        tracing::warn!(job_id = %job_id, tenant_id = %tenant_id, "recovered orphaned slot via emergency release");
        true
    }

    /// Single cleanup entry point for a worker finishing `job_id`.
    ///
    /// The slot is released only by whoever claims the pre-acquired flag, so
    /// calling this twice, or racing it with [`Self::emergency_release_slot`],
    /// releases one slot. When the flag cannot be read and `known_tenant` is
    /// absent, falls back to the emergency path. Never fails.
    pub async fn release_job_slot(
        &self,
        job_id: JobId,
        known_tenant: Option<TenantId>,
    ) -> CleanupStatus {
        let tenant_id = match self.claim_preacquired_tenant(job_id).await {
            Ok(Some(flagged)) => {
                if let Some(known) = known_tenant.filter(|known| *known != flagged) {
                    tracing::warn!(job_id = %job_id, known_tenant = %known, flagged_tenant = %flagged, "worker tenant disagrees with pre-acquired flag, releasing the flagged tenant");
                }
                flagged
            }
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "no pre-acquired flag, slot already released");
                return CleanupStatus::NothingToRelease;
            }
            Err(e) if known_tenant.is_some() => {
                tracing::warn!(job_id = %job_id, error = %e, "could not claim pre-acquired flag; slot held until TTL");
                return CleanupStatus::Failed {
                    reason: format!("claim_preacquired_flag: {e}"),
                };
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "could not resolve job tenant, trying emergency release");
                return if self.emergency_release_slot(job_id).await {
                    CleanupStatus::RecoveredByEmergency
                } else {
                    CleanupStatus::Failed {
                        reason: format!("tenant unresolved: {e}"),
                    }
                };
            }
        };

        match self.release_claimed(job_id, tenant_id).await {
            Ok(()) => CleanupStatus::Released { tenant_id },
            Err(reason) => CleanupStatus::Failed { reason },
        }
    }
}

fn parse_flag(job_id: JobId, raw: Option<String>) -> Result<Option<TenantId>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.parse::<TenantId>().map(Some).map_err(|e| {
        tracing::error!(job_id = %job_id, value = %raw, "corrupt pre-acquired flag");
        StoreError::UnexpectedReply(e.to_string())
    })
}

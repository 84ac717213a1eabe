//! Slot counter reconciliation.
//!
//! Counters can drift from the true number of running jobs when a worker
//! dies between acquire and release. The watchdog compares each counter with
//! an authoritative count and corrects it through the compare-and-swap
//! script, so a concurrent acquire or release is never overwritten.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use crawlgate_core::TenantId;
use thiserror::Error;
use tokio::sync::watch;

use crate::capacity::CapacityManager;
use crate::config::WatchdogConfig;
use crate::keys::{ACTIVE_JOBS_PATTERN, active_jobs_key, tenant_from_active_jobs_key};
use crate::store::{ReconcileOutcome, Store, StoreError, ttl_secs};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("active job source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Authoritative count of jobs holding a slot, per tenant.
///
/// Must include jobs that were dispatched but not yet picked up by a worker;
/// tenants missing from the map are taken to have none.
#[async_trait]
pub trait ActiveJobSource: Send + Sync {
    async fn active_counts(&self) -> Result<HashMap<TenantId, i64>, WatchdogError>;
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub in_sync: usize,
    pub corrected: usize,
    /// Counter moved between observation and correction; retried next pass.
    pub mismatched: usize,
    pub deleted: usize,
    /// Non-numeric counters, left untouched.
    pub invalid: usize,
    pub errors: usize,
}

pub struct SlotWatchdog<S: Store + ?Sized, A: ActiveJobSource + ?Sized> {
    store: Arc<S>,
    capacity: Arc<CapacityManager<S>>,
    source: Arc<A>,
    config: WatchdogConfig,
}

impl<S, A> SlotWatchdog<S, A>
where
    S: Store + ?Sized,
    A: ActiveJobSource + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        capacity: Arc<CapacityManager<S>>,
        source: Arc<A>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            store,
            capacity,
            source,
            config,
        }
    }

    /// Run one pass over every tenant with a counter or a running job.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, WatchdogError> {
        let truth = self.source.active_counts().await?;
        let keys = self.store.scan_keys(ACTIVE_JOBS_PATTERN).await?;

        let tenants: BTreeSet<TenantId> = keys
            .iter()
            .filter_map(|key| tenant_from_active_jobs_key(key))
            .chain(truth.keys().copied())
            .collect();

        let mut report = ReconcileReport::default();
        for tenant_id in tenants {
            report.checked += 1;
            let actual = truth.get(&tenant_id).copied().unwrap_or(0).max(0);
            if let Err(e) = self.reconcile_tenant(tenant_id, actual, &mut report).await {
                report.errors += 1;
                tracing::warn!(tenant_id = %tenant_id, error = %e, "failed to reconcile slot counter");
            }
        }

        if report.corrected > 0 || report.invalid > 0 {
            tracing::info!(
                checked = report.checked,
                corrected = report.corrected,
                mismatched = report.mismatched,
                invalid = report.invalid,
                "slot reconciliation pass complete"
            );
        }
        Ok(report)
    }

    async fn reconcile_tenant(
        &self,
        tenant_id: TenantId,
        actual: i64,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        let key = active_jobs_key(tenant_id);
        let Some(raw) = self.store.get(&key).await? else {
            // No counter to correct; the next acquire recreates it.
            if actual > 0 {
                report.deleted += 1;
            } else {
                report.in_sync += 1;
            }
            return Ok(());
        };

        let Ok(observed) = raw.parse::<i64>() else {
            report.invalid += 1;
            tracing::error!(tenant_id = %tenant_id, value = %raw, "slot counter is not numeric; needs operator attention");
            return Ok(());
        };

        if observed == actual {
            report.in_sync += 1;
            return Ok(());
        }

        let ttl = ttl_secs(self.capacity.slot_ttl(tenant_id).await);
        let outcome = self
            .store
            .reconcile_counter(&key, observed, actual, ttl)
            .await?;

        match outcome {
            ReconcileOutcome::Set | ReconcileOutcome::Cleared => {
                report.corrected += 1;
                tracing::warn!(tenant_id = %tenant_id, observed, actual, "corrected drifted slot counter");
            }
            ReconcileOutcome::Mismatch { current } => {
                report.mismatched += 1;
                tracing::debug!(tenant_id = %tenant_id, observed, current, "counter changed during reconciliation");
            }
            ReconcileOutcome::Deleted => report.deleted += 1,
            ReconcileOutcome::Invalid => {
                report.invalid += 1;
                tracing::error!(tenant_id = %tenant_id, "slot counter is not numeric; needs operator attention");
            }
            ReconcileOutcome::InvalidTtl => {
                report.errors += 1;
                tracing::error!(tenant_id = %tenant_id, ttl, "reconcile rejected slot TTL; check configuration");
            }
        }
        Ok(())
    }

    /// Reconcile every `interval` until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.config.interval.as_secs(), "slot watchdog started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::warn!(error = %e, "slot reconciliation pass failed");
                    }
                }
            }
        }
        tracing::info!("slot watchdog stopped");
    }
}

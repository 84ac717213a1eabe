//! Leader-elected feeder loop.

use std::sync::Arc;
use std::time::Duration;

use crawlgate_core::{JobId, TenantId};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::leader::{LeaderLease, Role};
use super::pending::{PendingEntry, PendingQueue};
use crate::capacity::{CapacityManager, JobSlot};
use crate::config::FeederConfig;
use crate::jobs::{JobQueue, PendingJob};
use crate::keys::LEADER_LOCK_KEY;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("leadership check failed: {0}")]
    Leadership(StoreError),

    #[error("failed to enumerate pending queues: {0}")]
    Scan(StoreError),
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedReport {
    pub role: Role,
    pub tenants_scanned: usize,
    pub dispatched: usize,
    /// Entries the executor already held; removed without a new dispatch.
    pub duplicates: usize,
    /// Tenants whose batch stopped because they were at capacity.
    pub deferred: usize,
    pub failed: usize,
    /// Undecodable entries dropped from a queue.
    pub malformed_removed: usize,
    /// Tenants skipped because of a store error.
    pub tenant_errors: usize,
    /// Leadership was lost in the middle of the scan.
    pub lease_lost: bool,
}

impl FeedReport {
    fn new(role: Role) -> Self {
        Self {
            role,
            tenants_scanned: 0,
            dispatched: 0,
            duplicates: 0,
            deferred: 0,
            failed: 0,
            malformed_removed: 0,
            tenant_errors: 0,
            lease_lost: false,
        }
    }

    /// True when the cycle moved at least one entry out of a queue.
    pub fn made_progress(&self) -> bool {
        self.dispatched + self.duplicates + self.malformed_removed > 0
    }
}

/// Result of handing one pending entry to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// The executor already had this job from an earlier attempt.
    Duplicate,
    /// No slot available; the entry stays queued.
    AtCapacity,
    /// Genuine failure; the slot was released and the entry stays queued.
    Failed { reason: String },
}

/// Feeder runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FeederStats {
    pub cycles: u64,
    pub cycles_as_leader: u64,
    pub jobs_dispatched: u64,
    pub duplicates: u64,
    pub deferred: u64,
    pub enqueue_failures: u64,
    pub malformed_removed: u64,
    pub leases_lost: u64,
    pub is_leader: bool,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
}

impl FeederStats {
    fn record(&mut self, report: &FeedReport) {
        self.cycles += 1;
        self.is_leader = report.role == Role::Leader && !report.lease_lost;
        if report.role == Role::Leader {
            self.cycles_as_leader += 1;
        }
        self.jobs_dispatched += report.dispatched as u64;
        self.duplicates += report.duplicates as u64;
        self.deferred += report.deferred as u64;
        self.enqueue_failures += report.failed as u64;
        self.malformed_removed += report.malformed_removed as u64;
        if report.lease_lost {
            self.leases_lost += 1;
        }
    }
}

/// Handle to control a running feeder.
#[derive(Debug)]
pub struct FeederHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<FeederStats>>,
}

impl FeederHandle {
    /// Request graceful shutdown, wait for the loop to release its lease and
    /// return the final statistics.
    pub async fn shutdown(mut self) -> FeederStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "feeder task ended abnormally");
            }
        }
        self.stats.lock().clone()
    }

    pub fn stats(&self) -> FeederStats {
        self.stats.lock().clone()
    }
}

enum TenantFlow {
    Continue,
    LeaseLost,
}

/// Single-active distributor from pending queues to the executor.
///
/// Every cycle: check leadership, enumerate tenants with pending work, and
/// for each one take up to its advisory free capacity from the head of the
/// queue. An entry leaves the queue only after the executor accepted it or
/// reported it as a duplicate.
pub struct CrawlFeeder<S: Store + ?Sized, Q: JobQueue + ?Sized> {
    capacity: Arc<CapacityManager<S>>,
    pending: PendingQueue<S>,
    queue: Arc<Q>,
    lease: LeaderLease<S>,
    config: FeederConfig,
    stats: Arc<Mutex<FeederStats>>,
}

impl<S, Q> CrawlFeeder<S, Q>
where
    S: Store + ?Sized + 'static,
    Q: JobQueue + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        capacity: Arc<CapacityManager<S>>,
        queue: Arc<Q>,
        config: FeederConfig,
    ) -> Self {
        let lease = LeaderLease::new(
            store.clone(),
            LEADER_LOCK_KEY,
            config.owner_id.clone(),
            config.lease_ttl,
        );
        Self {
            capacity,
            pending: PendingQueue::new(store),
            queue,
            lease,
            config,
            stats: Arc::new(Mutex::new(FeederStats::default())),
        }
    }

    pub fn pending(&self) -> &PendingQueue<S> {
        &self.pending
    }

    pub fn role(&self) -> Role {
        self.lease.role()
    }

    pub fn stats(&self) -> FeederStats {
        self.stats.lock().clone()
    }

    /// One leadership check followed, when leader, by one full scan.
    pub async fn run_cycle(&mut self) -> Result<FeedReport, FeederError> {
        let role = self.lease.ensure().await.map_err(FeederError::Leadership)?;
        let mut report = FeedReport::new(role);
        if role == Role::Follower {
            return Ok(report);
        }

        let tenants = self
            .pending
            .tenants_with_pending()
            .await
            .map_err(FeederError::Scan)?;

        for tenant_id in tenants {
            report.tenants_scanned += 1;
            match self.feed_tenant(tenant_id, &mut report).await {
                Ok(TenantFlow::Continue) => {}
                Ok(TenantFlow::LeaseLost) => {
                    report.lease_lost = true;
                    tracing::warn!(
                        owner = %self.lease.owner(),
                        tenant_id = %tenant_id,
                        "leadership lost mid-scan, abandoning cycle"
                    );
                    break;
                }
                Err(e) => {
                    report.tenant_errors += 1;
                    tracing::warn!(tenant_id = %tenant_id, error = %e, "skipping tenant this cycle");
                }
            }
        }

        if report.made_progress() || report.failed > 0 {
            tracing::info!(
                tenants = report.tenants_scanned,
                dispatched = report.dispatched,
                duplicates = report.duplicates,
                deferred = report.deferred,
                failed = report.failed,
                "feeder cycle complete"
            );
        }
        Ok(report)
    }

    async fn feed_tenant(
        &mut self,
        tenant_id: TenantId,
        report: &mut FeedReport,
    ) -> Result<TenantFlow, StoreError> {
        let available = self.capacity.get_available_capacity(tenant_id).await?;
        if available <= 0 {
            tracing::debug!(tenant_id = %tenant_id, "tenant at capacity, leaving queue untouched");
            report.deferred += 1;
            return Ok(TenantFlow::Continue);
        }

        let batch = usize::try_from(available)
            .unwrap_or(usize::MAX)
            .min(self.config.max_batch_per_tenant);
        let entries = self.pending.peek(tenant_id, batch).await?;

        for entry in entries {
            match self
                .lease
                .refresh_if_due(self.config.lease_refresh_interval)
                .await
            {
                Ok(true) => {}
                Ok(false) | Err(_) => return Ok(TenantFlow::LeaseLost),
            }

            let PendingEntry { raw, decoded } = entry;
            let job = match decoded {
                Ok(job) => job,
                Err(reason) => {
                    tracing::warn!(tenant_id = %tenant_id, reason = %reason, "removing undecodable pending entry");
                    if self.pending.remove(tenant_id, &raw).await? {
                        report.malformed_removed += 1;
                    }
                    continue;
                }
            };

            match self.dispatch(tenant_id, &raw, &job).await {
                DispatchOutcome::Dispatched => report.dispatched += 1,
                DispatchOutcome::Duplicate => report.duplicates += 1,
                DispatchOutcome::AtCapacity => {
                    report.deferred += 1;
                    break;
                }
                DispatchOutcome::Failed { .. } => {
                    report.failed += 1;
                    break;
                }
            }
        }
        Ok(TenantFlow::Continue)
    }

    /// Reserve a slot for `job`, hand it to the executor and drop the
    /// queue entry `raw` once the executor has it.
    pub async fn dispatch(&self, tenant_id: TenantId, raw: &str, job: &PendingJob) -> DispatchOutcome {
        let job_id = job.job_id;
        let flag_created = match self.capacity.acquire_slot_for_job(job_id, tenant_id).await {
            Ok(JobSlot::Reserved { flag_created }) => flag_created,
            Ok(JobSlot::AtCapacity) => return DispatchOutcome::AtCapacity,
            Err(e) => {
                tracing::warn!(job_id = %job_id, tenant_id = %tenant_id, error = %e, "failed to reserve slot");
                return DispatchOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let outcome = match self.queue.enqueue(job).await {
            Ok(true) => DispatchOutcome::Dispatched,
            Err(e) if e.is_duplicate() => {
                tracing::debug!(job_id = %job_id, tenant_id = %tenant_id, error = %e, "job already in executor, treating as dispatched");
                // The in-flight copy holds its own slot, and its flag if it
                // is still running.
                self.undo_reservation(tenant_id, job_id, flag_created, "duplicate job")
                    .await;
                DispatchOutcome::Duplicate
            }
            Ok(false) => {
                self.undo_reservation(tenant_id, job_id, flag_created, "executor declined job")
                    .await;
                return DispatchOutcome::Failed {
                    reason: "executor declined job".to_string(),
                };
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, tenant_id = %tenant_id, error = %e, "enqueue failed, job stays pending");
                self.undo_reservation(tenant_id, job_id, flag_created, "enqueue failed")
                    .await;
                return DispatchOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        match self.pending.remove(tenant_id, raw).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job_id, "pending entry already removed");
            }
            Err(e) => {
                // Retried next cycle; the executor will report it as a duplicate.
                tracing::warn!(job_id = %job_id, tenant_id = %tenant_id, error = %e, "failed to remove dispatched entry");
            }
        }
        outcome
    }

    /// Give back the slot this attempt reserved, and its flag when this
    /// attempt wrote it. A flag that predates the attempt is left alone.
    async fn undo_reservation(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        flag_created: bool,
        reason: &'static str,
    ) {
        if let Err(e) = self.capacity.release_slot(tenant_id).await {
            tracing::warn!(job_id = %job_id, reason, error = %e, "failed to release slot");
        }
        if !flag_created {
            return;
        }
        if let Err(e) = self.capacity.clear_preacquired_flag(job_id).await {
            tracing::warn!(job_id = %job_id, reason, error = %e, "failed to clear pre-acquired flag");
        }
    }

    /// Run cycles until `shutdown` turns true, then release the lease.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(owner = %self.lease.owner(), "crawl feeder started");
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    let pause = self.pause_after(&report);
                    let mut stats = self.stats.lock();
                    stats.record(&report);
                    stats.uptime_secs = started.elapsed().as_secs();
                    pause
                }
                Err(e) => {
                    tracing::warn!(owner = %self.lease.owner(), error = %e, "feeder cycle failed");
                    let mut stats = self.stats.lock();
                    stats.cycles += 1;
                    stats.is_leader = false;
                    stats.last_error = Some(e.to_string());
                    stats.uptime_secs = started.elapsed().as_secs();
                    self.config.follower_interval
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Err(e) = self.lease.release().await {
            tracing::warn!(owner = %self.lease.owner(), error = %e, "failed to release leadership on shutdown");
        }
        self.stats.lock().is_leader = false;
        tracing::info!(owner = %self.lease.owner(), "crawl feeder stopped");
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(mut self) -> FeederHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });

        FeederHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    fn pause_after(&self, report: &FeedReport) -> Duration {
        match report.role {
            Role::Follower => self.config.follower_interval,
            Role::Leader if report.lease_lost => self.config.follower_interval,
            Role::Leader if report.made_progress() => Duration::ZERO,
            Role::Leader => self.config.idle_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::StaticSettingsProvider;
    use crate::config::CapacityDefaults;
    use crate::jobs::{InMemoryJobQueue, JobKind};
    use crate::jobs::EnqueueError;
    use crate::keys::{active_jobs_key, pending_queue_key, slot_preacquired_key};
    use crate::store::{AtomicOps, InMemoryKvStore, KvStore};

    struct Harness {
        store: Arc<InMemoryKvStore>,
        queue: Arc<InMemoryJobQueue>,
        feeder: CrawlFeeder<InMemoryKvStore, InMemoryJobQueue>,
    }

    fn harness(limit: i64, owner: &str) -> Harness {
        let store = Arc::new(InMemoryKvStore::new());
        let queue = InMemoryJobQueue::arc();
        let capacity = Arc::new(CapacityManager::new(
            store.clone(),
            Arc::new(StaticSettingsProvider::new()),
            CapacityDefaults {
                concurrency_limit: limit,
                ..Default::default()
            },
        ));
        let config = FeederConfig::default().with_owner_id(owner);
        let feeder = CrawlFeeder::new(store.clone(), capacity, queue.clone(), config);
        Harness { store, queue, feeder }
    }

    fn job(tenant: TenantId, n: usize) -> PendingJob {
        PendingJob::new(tenant, JobKind::crawl(format!("https://example.com/{n}")), serde_json::json!({}))
    }

    async fn active(store: &InMemoryKvStore, tenant: TenantId) -> i64 {
        store
            .get(&active_jobs_key(tenant))
            .await
            .unwrap()
            .map(|v| v.parse().unwrap())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn follower_does_not_touch_queues() {
        let mut h = harness(5, "feeder-b");
        h.store
            .set_with_ttl(LEADER_LOCK_KEY, "feeder-a", Duration::from_secs(30))
            .await
            .unwrap();
        let tenant = TenantId::new();
        h.feeder.pending().push(&job(tenant, 1)).await.unwrap();

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.role, Role::Follower);
        assert_eq!(h.queue.attempts(), 0);
        assert_eq!(h.feeder.pending().len(tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leader_dispatches_up_to_capacity_in_fifo_order() {
        let mut h = harness(2, "feeder-a");
        let tenant = TenantId::new();
        let jobs: Vec<_> = (0..3).map(|n| job(tenant, n)).collect();
        for j in &jobs {
            h.feeder.pending().push(j).await.unwrap();
        }

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.role, Role::Leader);
        assert_eq!(report.dispatched, 2);

        let dispatched: Vec<_> = h.queue.enqueued().iter().map(|j| j.job_id).collect();
        assert_eq!(dispatched, vec![jobs[0].job_id, jobs[1].job_id]);
        assert_eq!(active(&h.store, tenant).await, 2);

        let remaining = h.feeder.pending().peek(tenant, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].decoded.as_ref().unwrap().job_id, jobs[2].job_id);
    }

    #[tokio::test]
    async fn full_tenant_is_deferred() {
        let mut h = harness(1, "feeder-a");
        let tenant = TenantId::new();
        h.store
            .acquire_slot(&active_jobs_key(tenant), 1, Duration::from_secs(60))
            .await
            .unwrap();
        h.feeder.pending().push(&job(tenant, 1)).await.unwrap();

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(h.feeder.pending().len(tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn genuine_failure_releases_slot_and_keeps_entry() {
        let mut h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        let pending = job(tenant, 1);
        h.feeder.pending().push(&pending).await.unwrap();
        h.queue.fail_next("Redis connection timeout");

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(active(&h.store, tenant).await, 0);
        assert_eq!(h.feeder.pending().len(tenant).await.unwrap(), 1);
        assert_eq!(
            h.store
                .get(&slot_preacquired_key(pending.job_id))
                .await
                .unwrap(),
            None
        );

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.feeder.pending().len(tenant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_is_removed_without_holding_an_extra_slot() {
        let mut h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        let pending = job(tenant, 1);
        h.queue.enqueue(&pending).await.unwrap();
        h.store
            .acquire_slot(&active_jobs_key(tenant), 5, Duration::from_secs(60))
            .await
            .unwrap();
        h.feeder.pending().push(&pending).await.unwrap();

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(active(&h.store, tenant).await, 1);
        assert_eq!(h.feeder.pending().len(tenant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_entry_is_dropped() {
        let mut h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        h.store
            .list_push(&pending_queue_key(tenant), "garbage")
            .await
            .unwrap();
        h.feeder.pending().push(&job(tenant, 1)).await.unwrap();

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.malformed_removed, 1);
        assert_eq!(report.dispatched, 1);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_leadership_error() {
        let mut h = harness(5, "feeder-a");
        h.store.set_unavailable(true);
        assert!(matches!(
            h.feeder.run_cycle().await,
            Err(FeederError::Leadership(_))
        ));
    }

    #[tokio::test]
    async fn spawned_feeder_releases_lock_on_shutdown() {
        let h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        h.feeder.pending().push(&job(tenant, 1)).await.unwrap();
        let store = h.store.clone();
        let queue = h.queue.clone();

        let handle = h.feeder.spawn();
        for _ in 0..100 {
            if handle.stats().jobs_dispatched >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.enqueued().len(), 1);
        assert!(handle.stats().is_leader);

        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_dispatched, 1);
        assert!(!stats.is_leader);
        assert_eq!(store.get(LEADER_LOCK_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_of_finished_job_leaves_no_flag_behind() {
        let mut h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        let finished = job(tenant, 1);
        // The executor ran the job and its cleanup already cleared slot and flag.
        h.queue.enqueue(&finished).await.unwrap();
        h.feeder.pending().push(&finished).await.unwrap();

        let report = h.feeder.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(active(&h.store, tenant).await, 0);
        assert_eq!(h.store.get(&slot_preacquired_key(finished.job_id)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_keeps_the_flag_of_the_running_copy() {
        let mut h = harness(5, "feeder-a");
        let tenant = TenantId::new();
        let running = job(tenant, 1);
        let earlier = CapacityManager::new(
            h.store.clone(),
            Arc::new(StaticSettingsProvider::new()),
            CapacityDefaults::default(),
        );
        assert!(earlier.acquire_slot_for_job(running.job_id, tenant).await.unwrap().is_reserved());
        h.queue.enqueue(&running).await.unwrap();
        h.feeder.pending().push(&running).await.unwrap();

        assert_eq!(h.feeder.run_cycle().await.unwrap().duplicates, 1);
        assert_eq!(active(&h.store, tenant).await, 1);
        assert_eq!(
            h.store.get(&slot_preacquired_key(running.job_id)).await.unwrap(),
            Some(tenant.to_string())
        );
    }

    /// Executor queue that hands the leader lock to another feeder after
    /// accepting its first job, as if this process had stalled past its lease.
    struct StallingQueue {
        inner: InMemoryJobQueue,
        store: Arc<InMemoryKvStore>,
        stall: Duration,
    }

    #[async_trait::async_trait]
    impl JobQueue for StallingQueue {
        async fn enqueue(&self, job: &PendingJob) -> Result<bool, EnqueueError> {
            let accepted = self.inner.enqueue(job).await?;
            if self.inner.enqueued().len() == 1 {
                tokio::time::advance(self.stall).await;
                self.store
                    .set_with_ttl(LEADER_LOCK_KEY, "feeder-b", Duration::from_secs(30))
                    .await
                    .map_err(|e| EnqueueError::new(e.to_string()))?;
            }
            Ok(accepted)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_lost_mid_scan_stops_dispatching() {
        let store = Arc::new(InMemoryKvStore::new());
        let config = FeederConfig::default().with_owner_id("feeder-a");
        let queue = Arc::new(StallingQueue {
            inner: InMemoryJobQueue::new(),
            store: store.clone(),
            stall: config.lease_refresh_interval + Duration::from_secs(1),
        });
        let capacity = Arc::new(CapacityManager::new(
            store.clone(),
            Arc::new(StaticSettingsProvider::new()),
            CapacityDefaults::default(),
        ));
        let mut feeder = CrawlFeeder::new(store.clone(), capacity, queue.clone(), config);

        let tenant = TenantId::new();
        for n in 0..4 {
            feeder.pending().push(&job(tenant, n)).await.unwrap();
        }

        let report = feeder.run_cycle().await.unwrap();
        assert_eq!(report.role, Role::Leader);
        assert!(report.lease_lost);
        assert_eq!(report.dispatched, 1);
        assert_eq!(queue.inner.attempts(), 1);
        assert_eq!(feeder.pending().len(tenant).await.unwrap(), 3);
        assert_eq!(feeder.role(), Role::Follower);
        assert_eq!(store.get(LEADER_LOCK_KEY).await.unwrap().as_deref(), Some("feeder-b"));
    }
}

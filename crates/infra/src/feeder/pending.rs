use std::sync::Arc;

use crawlgate_core::TenantId;
use thiserror::Error;

use crate::jobs::PendingJob;
use crate::keys::{PENDING_QUEUE_PATTERN, pending_queue_key, tenant_from_pending_key};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum PendingQueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode pending job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One entry read from a pending queue.
///
/// `raw` is the exact stored string; removal always uses it, never a
/// re-encoding of `decoded`.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub raw: String,
    pub decoded: Result<PendingJob, String>,
}

/// Per-tenant FIFO of jobs waiting for capacity.
pub struct PendingQueue<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> Clone for PendingQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store + ?Sized> PendingQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append `job` to its tenant's queue; returns the queue length.
    pub async fn push(&self, job: &PendingJob) -> Result<usize, PendingQueueError> {
        let raw = job.encode()?;
        let len = self
            .store
            .list_push(&pending_queue_key(job.tenant_id), &raw)
            .await?;
        Ok(len)
    }

    /// Read up to `limit` entries from the head without removing them.
    pub async fn peek(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<PendingEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX).saturating_sub(1);
        let raws = self
            .store
            .list_range(&pending_queue_key(tenant_id), 0, stop)
            .await?;

        Ok(raws
            .into_iter()
            .map(|raw| {
                let decoded = PendingJob::decode(&raw).map_err(|e| e.to_string());
                PendingEntry { raw, decoded }
            })
            .collect())
    }

    /// Remove the first entry byte-equal to `raw`. Safe to repeat: a second
    /// call finds nothing and returns `false`.
    pub async fn remove(&self, tenant_id: TenantId, raw: &str) -> Result<bool, StoreError> {
        let removed = self
            .store
            .list_remove(&pending_queue_key(tenant_id), raw)
            .await?;
        Ok(removed > 0)
    }

    pub async fn len(&self, tenant_id: TenantId) -> Result<usize, StoreError> {
        self.store.list_len(&pending_queue_key(tenant_id)).await
    }

    /// Tenants whose pending queue currently exists, in key order.
    pub async fn tenants_with_pending(&self) -> Result<Vec<TenantId>, StoreError> {
        let keys = self.store.scan_keys(PENDING_QUEUE_PATTERN).await?;
        let mut tenants: Vec<TenantId> = keys
            .iter()
            .filter_map(|key| {
                let tenant = tenant_from_pending_key(key);
                if tenant.is_none() {
                    tracing::debug!(key = %key, "ignoring malformed pending queue key");
                }
                tenant
            })
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}

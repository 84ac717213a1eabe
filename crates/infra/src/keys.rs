//! Store key schema.
//!
//! These names are shared with every co-deployed component that touches the
//! same counters and queues, so they must stay bit-exact.

use crawlgate_core::{JobId, TenantId};

/// Global leadership lock for the crawl feeder.
pub const LEADER_LOCK_KEY: &str = "crawl_feeder:leader";

/// Scan pattern matching every tenant's pending crawl queue.
pub const PENDING_QUEUE_PATTERN: &str = "tenant:*:crawl_pending";

/// Scan pattern matching every tenant's slot counter.
pub const ACTIVE_JOBS_PATTERN: &str = "tenant:*:active_jobs";

const TENANT_PREFIX: &str = "tenant:";
const ACTIVE_JOBS_SUFFIX: &str = ":active_jobs";
const PENDING_SUFFIX: &str = ":crawl_pending";

/// `tenant:{tenant_id}:active_jobs`
pub fn active_jobs_key(tenant_id: TenantId) -> String {
    format!("{TENANT_PREFIX}{tenant_id}{ACTIVE_JOBS_SUFFIX}")
}

/// `tenant:{tenant_id}:crawl_pending`
pub fn pending_queue_key(tenant_id: TenantId) -> String {
    format!("{TENANT_PREFIX}{tenant_id}{PENDING_SUFFIX}")
}

/// `job:{job_id}:slot_preacquired`
pub fn slot_preacquired_key(job_id: JobId) -> String {
    format!("job:{job_id}:slot_preacquired")
}

/// Tenant id embedded in a pending-queue key, if the key is well formed.
pub fn tenant_from_pending_key(key: &str) -> Option<TenantId> {
    tenant_between(key, PENDING_SUFFIX)
}

/// Tenant id embedded in a slot-counter key, if the key is well formed.
pub fn tenant_from_active_jobs_key(key: &str) -> Option<TenantId> {
    tenant_between(key, ACTIVE_JOBS_SUFFIX)
}

fn tenant_between(key: &str, suffix: &str) -> Option<TenantId> {
    key.strip_prefix(TENANT_PREFIX)?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn key_names_are_bit_exact() {
        let tenant = TenantId::from_uuid(Uuid::nil());
        let job = JobId::from_uuid(Uuid::nil());
        let nil = "00000000-0000-0000-0000-000000000000";

        assert_eq!(active_jobs_key(tenant), format!("tenant:{nil}:active_jobs"));
        assert_eq!(pending_queue_key(tenant), format!("tenant:{nil}:crawl_pending"));
        assert_eq!(slot_preacquired_key(job), format!("job:{nil}:slot_preacquired"));
        assert_eq!(LEADER_LOCK_KEY, "crawl_feeder:leader");
    }

    #[test]
    fn tenant_is_recovered_from_keys() {
        let tenant = TenantId::new();
        assert_eq!(tenant_from_pending_key(&pending_queue_key(tenant)), Some(tenant));
        assert_eq!(tenant_from_active_jobs_key(&active_jobs_key(tenant)), Some(tenant));
        assert_eq!(tenant_from_pending_key(&active_jobs_key(tenant)), None);
        assert_eq!(tenant_from_pending_key("tenant:not-a-uuid:crawl_pending"), None);
    }
}

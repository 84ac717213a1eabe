use std::collections::HashMap;
use std::time::Duration;

use crawlgate_core::TenantId;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Breaker state for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Acquisitions go to the shared store.
    Closed,
    /// Acquisitions use the in-process fallback until `until`.
    Open { until: Instant },
}

/// Time-boxed circuit breaker keyed by tenant.
///
/// There is no half-open probe: once `timeout` has elapsed the next acquire
/// simply tries the store again, and a fresh failure re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    timeout: Duration,
    open_until: Mutex<HashMap<TenantId, Instant>>,
}

impl CircuitBreaker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            open_until: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open (or re-open) the breaker for `tenant_id`.
    pub fn trip(&self, tenant_id: TenantId) -> Instant {
        let until = Instant::now() + self.timeout;
        self.open_until.lock().insert(tenant_id, until);
        until
    }

    pub fn is_open(&self, tenant_id: TenantId) -> bool {
        matches!(self.state(tenant_id), BreakerState::Open { .. })
    }

    pub fn state(&self, tenant_id: TenantId) -> BreakerState {
        let mut open_until = self.open_until.lock();
        match open_until.get(&tenant_id).copied() {
            Some(until) if Instant::now() < until => BreakerState::Open { until },
            Some(_) => {
                open_until.remove(&tenant_id);
                BreakerState::Closed
            }
            None => BreakerState::Closed,
        }
    }
}

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure talking to the shared store.
///
/// Every variant is treated as "store unavailable" by callers that have a
/// local fallback; none of them mean "at capacity" or "not leader".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Result of the compare-and-swap used by the slot watchdog.
///
/// The wire tags (`ok:set`, `ok:del`, `mismatch:<n>`, `deleted`, `invalid`,
/// `invalid_ttl`) are shared with every other component that runs the same
/// script, so they are parsed rather than invented per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The counter matched the observation and now holds the new value.
    Set,
    /// The new value was `<= 0`, so the counter key was removed.
    Cleared,
    /// The counter changed since it was observed; re-observe, never overwrite.
    Mismatch { current: i64 },
    /// The counter key no longer exists.
    Deleted,
    /// The counter holds a non-numeric value (data corruption).
    Invalid,
    /// The TTL argument was not a positive number of seconds.
    InvalidTtl,
}

impl ReconcileOutcome {
    pub fn as_tag(&self) -> String {
        match self {
            Self::Set => "ok:set".to_string(),
            Self::Cleared => "ok:del".to_string(),
            Self::Mismatch { current } => format!("mismatch:{current}"),
            Self::Deleted => "deleted".to_string(),
            Self::Invalid => "invalid".to_string(),
            Self::InvalidTtl => "invalid_ttl".to_string(),
        }
    }

    /// True when the counter now reflects the requested value.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Set | Self::Cleared)
    }
}

impl FromStr for ReconcileOutcome {
    type Err = StoreError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "ok:set" => Ok(Self::Set),
            "ok:del" => Ok(Self::Cleared),
            "deleted" => Ok(Self::Deleted),
            "invalid" => Ok(Self::Invalid),
            "invalid_ttl" => Ok(Self::InvalidTtl),
            other => other
                .strip_prefix("mismatch:")
                .and_then(|current| current.parse::<i64>().ok())
                .map(|current| Self::Mismatch { current })
                .ok_or_else(|| StoreError::UnexpectedReply(format!("reconcile tag {other:?}"))),
        }
    }
}

/// Whole seconds for a store TTL; sub-second TTLs round up to one second.
pub fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// The fixed set of atomic scripts run against the store.
#[async_trait]
pub trait AtomicOps: Send + Sync {
    /// Take one slot on the counter at `key`.
    ///
    /// Returns the new counter value (`>= 1`) on success and `0` when the
    /// limit is reached. `limit <= 0` means unlimited and always returns `1`
    /// without touching the key. A rejected acquire never refreshes the TTL.
    async fn acquire_slot(&self, key: &str, limit: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Give one slot back. Absent key is a no-op returning `0`; reaching
    /// `<= 0` deletes the key; otherwise the TTL is refreshed and the
    /// remaining count returned.
    async fn release_slot(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Extend the lock TTL only if `owner` still holds it. Never creates the key.
    async fn refresh_leader_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete the lock only if `owner` still holds it.
    async fn release_leader_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Compare-and-swap the counter from `observed` to `new_value`.
    async fn reconcile_counter(
        &self,
        key: &str,
        observed: i64,
        new_value: i64,
        ttl_secs: i64,
    ) -> Result<ReconcileOutcome, StoreError>;
}

/// Plain key-value, list and scan operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `SET key value NX EX ttl`: true when the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// `GETDEL`: read and remove a string key in one step. Of several
    /// concurrent callers at most one sees the value.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// True when a key was removed. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append to the tail of a list; returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Inclusive range with negative indexes counting from the tail.
    async fn list_range(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, StoreError>;

    /// Remove the first element byte-equal to `value`; returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Keys matching a glob pattern where `*` matches any run of characters.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Everything the concurrency subsystem needs from one backend.
pub trait Store: AtomicOps + KvStore {}

impl<T: AtomicOps + KvStore + ?Sized> Store for T {}

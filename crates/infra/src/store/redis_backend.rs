//! Redis-backed store (async, connection-managed).
//!
//! Atomic operations run as cached Lua scripts (`EVALSHA` with `EVAL`
//! fallback handled by the client). Every call is bounded by `op_timeout` so
//! a hung connection surfaces as [`StoreError::Timeout`] instead of stalling
//! the feeder or a worker.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{RedisError, RedisResult, Script};
use async_trait::async_trait;
use tracing::instrument;

use super::r#trait::{AtomicOps, KvStore, ReconcileOutcome, StoreError, ttl_secs};
use super::scripts;

const SCAN_BATCH: usize = 200;

struct Scripts {
    acquire_slot: Script,
    release_slot: Script,
    refresh_leader_lock: Script,
    release_leader_lock: Script,
    reconcile_counter: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            acquire_slot: Script::new(scripts::ACQUIRE_SLOT),
            release_slot: Script::new(scripts::RELEASE_SLOT),
            refresh_leader_lock: Script::new(scripts::REFRESH_LEADER_LOCK),
            release_leader_lock: Script::new(scripts::RELEASE_LEADER_LOCK),
            reconcile_counter: Script::new(scripts::RECONCILE_COUNTER),
        }
    }
}

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    scripts: std::sync::Arc<Scripts>,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `op_timeout` - Upper bound for every single store round trip
    pub async fn connect(
        redis_url: impl AsRef<str>,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            op_timeout,
            scripts: std::sync::Arc::new(Scripts::load()),
        })
    }

    /// Shared connection handle, for adapters that live next to the store.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RedisResult<T>> + Send,
    ) -> Result<T, StoreError> {
        bounded(self.op_timeout, op, fut).await
    }
}

/// Await a Redis call with a deadline, mapping failures onto [`StoreError`].
pub(crate) async fn bounded<T>(
    op_timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = RedisResult<T>> + Send,
) -> Result<T, StoreError> {
    match tokio::time::timeout(op_timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(map_redis_error(op, e)),
        Err(_) => Err(StoreError::Timeout(op_timeout)),
    }
}

fn map_redis_error(op: &str, e: RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Command(format!("{op} timed out: {e}"))
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(format!("{op}: {e}"))
    } else {
        StoreError::Command(format!("{op} failed: {e}"))
    }
}

#[async_trait]
impl AtomicOps for RedisKvStore {
    #[instrument(skip(self), err)]
    async fn acquire_slot(&self, key: &str, limit: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.acquire_slot.prepare_invoke();
        invocation.key(key).arg(limit).arg(ttl_secs(ttl));
        self.bounded("acquire_slot", invocation.invoke_async(&mut conn))
            .await
    }

    #[instrument(skip(self), err)]
    async fn release_slot(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.release_slot.prepare_invoke();
        invocation.key(key).arg(ttl_secs(ttl));
        self.bounded("release_slot", invocation.invoke_async(&mut conn))
            .await
    }

    #[instrument(skip(self), err)]
    async fn refresh_leader_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.refresh_leader_lock.prepare_invoke();
        invocation.key(key).arg(owner).arg(ttl_secs(ttl));
        let refreshed: i64 = self
            .bounded("refresh_leader_lock", invocation.invoke_async(&mut conn))
            .await?;
        Ok(refreshed == 1)
    }

    #[instrument(skip(self), err)]
    async fn release_leader_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.release_leader_lock.prepare_invoke();
        invocation.key(key).arg(owner);
        let deleted: i64 = self
            .bounded("release_leader_lock", invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted == 1)
    }

    #[instrument(skip(self), err)]
    async fn reconcile_counter(
        &self,
        key: &str,
        observed: i64,
        new_value: i64,
        ttl_secs: i64,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.reconcile_counter.prepare_invoke();
        invocation.key(key).arg(observed).arg(new_value).arg(ttl_secs);
        let tag: String = self
            .bounded("reconcile_counter", invocation.invoke_async(&mut conn))
            .await?;
        tag.parse()
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("GET", ::redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded(
                "SET EX",
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: Option<String> = self
            .bounded(
                "SET NX EX",
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(created.is_some())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("GETDEL", ::redis::cmd("GETDEL").arg(key).query_async(&mut conn))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded("DEL", ::redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(
            "RPUSH",
            ::redis::cmd("RPUSH").arg(key).arg(value).query_async(&mut conn),
        )
        .await
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(
            "LRANGE",
            ::redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn),
        )
        .await
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(
            "LREM",
            ::redis::cmd("LREM")
                .arg(key)
                .arg(1)
                .arg(value)
                .query_async(&mut conn),
        )
        .await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("LLEN", ::redis::cmd("LLEN").arg(key).query_async(&mut conn))
            .await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    ::redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

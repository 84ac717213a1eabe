//! Redis list executor queue.
//!
//! Jobs are pushed onto a shared list consumed by the executor workers. A
//! per-job guard key makes submission idempotent: a second submission of the
//! same id is refused with an "already exists" error, which the feeder
//! recognises as a duplicate.

use std::time::Duration;

use ::redis::Script;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use tracing::instrument;

use super::queue::{EnqueueError, JobQueue};
use super::types::PendingJob;
use crate::store::redis_backend::bounded;
use crate::store::{RedisKvStore, ttl_secs};

/// List consumed by the executor workers.
pub const DEFAULT_QUEUE_KEY: &str = "crawl_jobs";

/// How long a job id stays reserved after submission.
pub const DEFAULT_GUARD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// Guard and push in one atomic step so a failed push never leaves a guard
// that would turn every retry into a false duplicate.
const ENQUEUE_GUARDED: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    redis.call('RPUSH', KEYS[2], ARGV[3])
    return 1
end
return 0
"#;

fn guard_key(job: &PendingJob) -> String {
    format!("crawl_job:{}", job.job_id)
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    op_timeout: Duration,
    queue_key: String,
    guard_ttl: Duration,
    script: Script,
}

impl RedisJobQueue {
    /// Share the connection of an existing store.
    pub fn new(store: &RedisKvStore) -> Self {
        Self {
            conn: store.connection(),
            op_timeout: store.op_timeout(),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            guard_ttl: DEFAULT_GUARD_TTL,
            script: Script::new(ENQUEUE_GUARDED),
        }
    }

    pub fn with_queue_key(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self
    }

    pub fn with_guard_ttl(mut self, guard_ttl: Duration) -> Self {
        self.guard_ttl = guard_ttl;
        self
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, tenant_id = %job.tenant_id))]
    async fn enqueue(&self, job: &PendingJob) -> Result<bool, EnqueueError> {
        let encoded = job
            .encode()
            .map_err(|e| EnqueueError::new(format!("failed to encode job: {e}")))?;

        let mut conn = self.conn.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(guard_key(job))
            .key(&self.queue_key)
            .arg(job.tenant_id.to_string())
            .arg(ttl_secs(self.guard_ttl))
            .arg(encoded);

        let created: i64 = bounded(
            self.op_timeout,
            "enqueue_job",
            invocation.invoke_async(&mut conn),
        )
        .await
        .map_err(|e| EnqueueError::new(e.to_string()))?;

        if created == 0 {
            return Err(EnqueueError::new(format!(
                "job {} already exists in queue",
                job.job_id
            )));
        }
        Ok(true)
    }
}

//! External executor boundary.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crawlgate_core::JobId;

use super::types::PendingJob;

/// Phrases executors use when refusing a job id they already hold.
///
/// Kept narrow on purpose: validation errors such as
/// "invalid job_id format" must not match.
const DUPLICATE_MARKERS: [&str; 3] = ["already exists", "duplicate", "job exists"];

/// True when `message` reports a duplicate submission of the same job id.
pub fn is_duplicate_submission(message: &str) -> bool {
    let normalized = message.to_lowercase();
    DUPLICATE_MARKERS
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Rejection from the executor, carrying its message text verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EnqueueError {
    message: String,
}

impl EnqueueError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_duplicate(&self) -> bool {
        is_duplicate_submission(&self.message)
    }
}

/// Queue of the external job executor.
///
/// `Ok(true)` means accepted. `Ok(false)` means declined without an error
/// and is treated like a failure by the feeder.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &PendingJob) -> Result<bool, EnqueueError>;
}

#[derive(Debug, Default)]
struct QueueState {
    ids: HashSet<JobId>,
    jobs: Vec<PendingJob>,
    injected_failures: VecDeque<String>,
    attempts: usize,
}

/// In-memory executor queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next enqueue call fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().injected_failures.push_back(message.into());
    }

    /// Jobs accepted so far, in acceptance order.
    pub fn enqueued(&self) -> Vec<PendingJob> {
        self.state.lock().jobs.clone()
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().ids.contains(&job_id)
    }

    /// Enqueue attempts so far, including rejected ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &PendingJob) -> Result<bool, EnqueueError> {
        let mut state = self.state.lock();
        state.attempts += 1;

        if let Some(message) = state.injected_failures.pop_front() {
            return Err(EnqueueError::new(message));
        }
        if !state.ids.insert(job.job_id) {
            return Err(EnqueueError::new(format!(
                "job {} already exists in queue",
                job.job_id
            )));
        }
        state.jobs.push(job.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;
    use crawlgate_core::TenantId;

    fn job() -> PendingJob {
        PendingJob::new(TenantId::new(), JobKind::crawl("https://example.com"), serde_json::json!({}))
    }

    #[test]
    fn duplicate_phrases_match() {
        assert!(is_duplicate_submission("job already exists in queue"));
        assert!(is_duplicate_submission("Duplicate entry detected"));
        assert!(is_duplicate_submission("job exists in ARQ"));
        assert!(is_duplicate_submission("JOB ALREADY EXISTS"));
    }

    #[test]
    fn unrelated_errors_do_not_match() {
        assert!(!is_duplicate_submission("Redis connection timeout"));
        assert!(!is_duplicate_submission("invalid job_id format"));
        assert!(!is_duplicate_submission("job_id missing"));
        assert!(!is_duplicate_submission(""));
    }

    #[tokio::test]
    async fn second_enqueue_of_same_id_is_a_duplicate() {
        let queue = InMemoryJobQueue::new();
        let job = job();

        assert_eq!(queue.enqueue(&job).await, Ok(true));
        let err = queue.enqueue(&job).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(queue.enqueued().len(), 1);
        assert_eq!(queue.attempts(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let queue = InMemoryJobQueue::new();
        queue.fail_next("Redis connection timeout");
        let job = job();

        let err = queue.enqueue(&job).await.unwrap_err();
        assert_eq!(err.message(), "Redis connection timeout");
        assert!(!err.is_duplicate());
        assert!(!queue.contains(job.job_id));

        assert_eq!(queue.enqueue(&job).await, Ok(true));
        assert!(queue.contains(job.job_id));
    }
}

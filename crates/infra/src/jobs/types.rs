//! Pending job record shared by the feeder and the external executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crawlgate_core::{JobId, TenantId};

/// Job kind for routing on the executor side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Web crawl starting at `url`
    Crawl { url: String },
    /// Long-running background task
    Background { task: String },
}

impl JobKind {
    pub fn crawl(url: impl Into<String>) -> Self {
        Self::Crawl { url: url.into() }
    }

    pub fn background(task: impl Into<String>) -> Self {
        Self::Background { task: task.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Crawl { .. } => "crawl",
            JobKind::Background { .. } => "background",
        }
    }
}

/// A job waiting in a tenant's pending queue.
///
/// Serialized with a fixed field order; the encoded string is what the
/// pending queue matches on when removing an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    /// JSON payload handed to the executor untouched
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingJob {
    pub fn new(tenant_id: TenantId, kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            job_id: JobId::new(),
            tenant_id,
            kind,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

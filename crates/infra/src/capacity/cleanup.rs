use std::fmt::Display;
use std::future::Future;

use crawlgate_core::TenantId;

/// Outcome of a worker's end-of-job slot cleanup.
///
/// Cleanup never fails the caller; this status says what actually happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    /// The slot was released for `tenant_id`.
    Released { tenant_id: TenantId },
    /// No tenant could be associated with the job (flag already gone).
    NothingToRelease,
    /// The tenant was recovered from the pre-acquired flag by the
    /// last-resort path after the normal lookup failed.
    RecoveredByEmergency,
    /// Every path failed; the slot stays held until its TTL expires.
    Failed { reason: String },
}

impl CleanupStatus {
    pub fn released_slot(&self) -> bool {
        matches!(self, Self::Released { .. } | Self::RecoveredByEmergency)
    }
}

/// Await a cleanup step, turning an error into a logged reason.
pub(crate) async fn best_effort<T, E, F>(step: &'static str, fut: F) -> Result<T, String>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    fut.await.map_err(|e| {
        tracing::warn!(step, error = %e, "cleanup step failed");
        format!("{step}: {e}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_effort_passes_values_through() {
        let value = best_effort("noop", async { Ok::<_, String>(7) }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn best_effort_names_the_failed_step() {
        let err = best_effort("release_slot", async { Err::<(), _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "release_slot: boom");
    }

    #[test]
    fn only_releases_count_as_released() {
        assert!(CleanupStatus::RecoveredByEmergency.released_slot());
        assert!(!CleanupStatus::NothingToRelease.released_slot());
        assert!(
            !CleanupStatus::Failed {
                reason: "x".to_string()
            }
            .released_slot()
        );
    }
}

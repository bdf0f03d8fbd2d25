//! Stale job recovery.

use std::time::Duration;

use tracing::{info, instrument, warn};

use super::store::{JobStore, JobStoreError};
use super::types::RecoveryReport;

/// Returns abandoned `processing` jobs to the queue.
///
/// A job is abandoned once its heartbeat is older than `threshold`. Jobs with
/// attempts left go back to `pending`; the rest are failed. Running it twice
/// in a row changes nothing the second time.
#[derive(Debug, Clone)]
pub struct StaleRecovery<S: JobStore> {
    store: S,
    threshold: Duration,
}

impl<S: JobStore> StaleRecovery<S> {
    pub fn new(store: S, threshold: Duration) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    #[instrument(skip(self), fields(threshold_secs = self.threshold.as_secs()), err)]
    pub async fn recover_stale(&self) -> Result<RecoveryReport, JobStoreError> {
        let report = self.store.recover_stale(self.threshold).await?;

        for job_id in &report.requeued {
            warn!(%job_id, "requeued job with expired heartbeat");
        }
        for job_id in &report.failed {
            warn!(%job_id, "failed job with expired heartbeat and no attempts left");
        }
        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "stale recovery finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::Utc;
    use ingestq_core::{JobStatus, JobType, NewJob, STALE_EXHAUSTED_ERROR, STALE_REQUEUED_ERROR};
    use serde_json::json;
    use std::sync::Arc;

    async fn enqueue(store: &InMemoryJobStore, max_attempts: u32) {
        let job = NewJob::new(JobType::crawl_page_ingest(), json!({"url": "https://example.com/a"}))
            .with_max_attempts(max_attempts)
            .into_job(0, 3, Utc::now())
            .unwrap();
        store.enqueue(&job).await.unwrap();
    }

    #[tokio::test]
    async fn fresh_jobs_are_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        enqueue(&store, 3).await;
        store.claim_batch(1).await.unwrap();

        let recovery = StaleRecovery::new(store.clone(), Duration::from_secs(600));
        assert!(recovery.recover_stale().await.unwrap().is_empty());
        assert_eq!(store.list_by_status(JobStatus::Processing, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeues_or_fails_by_remaining_attempts() {
        let store = Arc::new(InMemoryJobStore::new());
        enqueue(&store, 3).await;
        enqueue(&store, 1).await;
        let claimed = store.claim_batch(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let recovery = StaleRecovery::new(store.clone(), Duration::ZERO);
        let report = recovery.recover_stale().await.unwrap();
        assert_eq!(report.total(), 2);

        let requeued = store.get(report.requeued[0]).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.last_error.as_deref(), Some(STALE_REQUEUED_ERROR));

        let failed = store.get(report.failed[0]).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some(STALE_EXHAUSTED_ERROR));

        assert!(claimed.iter().all(|j| report.requeued.contains(&j.id) || report.failed.contains(&j.id)));
        assert!(recovery.recover_stale().await.unwrap().is_empty());
    }
}

//! In-memory `JobStore` with the same claim and fencing semantics as Postgres.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use ingestq_core::{Job, JobId, JobProgress, JobStatus, ProgressScope};

use super::r#trait::{JobStore, JobStoreError};
use crate::jobs::types::{ClaimToken, JobOutcome, RecoveryReport};

/// In-memory job store for tests and single-process use.
///
/// One mutex guards the whole table, which gives every operation the same
/// atomicity the Postgres store gets from row locks.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory job table lock poisoned".to_string()))
    }

    /// Apply `f` to the job only if it is still held under `claim`.
    /// `None` means the claim is gone.
    fn with_claim<T, F>(&self, claim: ClaimToken, f: F) -> Result<Option<T>, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, JobStoreError>,
    {
        let mut jobs = self.lock()?;
        let job = jobs
            .get_mut(&claim.job_id)
            .ok_or(JobStoreError::NotFound(claim.job_id))?;
        if !job.is_held_by(claim.attempt) {
            return Ok(None);
        }
        f(job).map(Some)
    }
}

fn transition_error(e: ingestq_core::DomainError) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: &Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.lock()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| (Reverse(j.priority), j.created_at, j.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
        for (_, _, id) in candidates.into_iter().take(limit) {
            if let Some(job) = jobs.get_mut(&id) {
                job.claim(now).map_err(transition_error)?;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew_heartbeat(&self, claim: ClaimToken) -> Result<bool, JobStoreError> {
        let renewed = self.with_claim(claim, |job| {
            job.renew_heartbeat(Utc::now()).map_err(transition_error)
        })?;
        Ok(renewed.is_some())
    }

    async fn complete(&self, claim: ClaimToken) -> Result<JobOutcome, JobStoreError> {
        let outcome = self.with_claim(claim, |job| {
            job.complete(Utc::now()).map_err(transition_error)?;
            Ok(JobOutcome::Completed)
        })?;
        Ok(outcome.unwrap_or(JobOutcome::Lost))
    }

    async fn fail_attempt(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        let outcome = self.with_claim(claim, |job| {
            match job.fail_attempt(error, Utc::now()).map_err(transition_error)? {
                JobStatus::Pending => Ok(JobOutcome::Requeued),
                _ => Ok(JobOutcome::Failed),
            }
        })?;
        Ok(outcome.unwrap_or(JobOutcome::Lost))
    }

    async fn fail_permanently(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        let outcome = self.with_claim(claim, |job| {
            job.fail(error, Utc::now()).map_err(transition_error)?;
            Ok(JobOutcome::Failed)
        })?;
        Ok(outcome.unwrap_or(JobOutcome::Lost))
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<RecoveryReport, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        let Some(stale_before) = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
        else {
            return Ok(report);
        };

        for job in jobs.values_mut().filter(|j| j.is_stale(stale_before)) {
            match job.recover_stale(now).map_err(transition_error)? {
                JobStatus::Pending => report.requeued.push(job.id),
                _ => report.failed.push(job.id),
            }
        }

        report.requeued.sort();
        report.failed.sort();
        Ok(report)
    }

    async fn progress(&self, scope: &ProgressScope) -> Result<JobProgress, JobStoreError> {
        let jobs = self.lock()?;
        let mut progress = JobProgress::default();
        for job in jobs.values().filter(|j| scope.matches(j)) {
            progress.record(job.status);
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestq_core::{ApplicationId, JobContext, JobType, NewJob};
    use serde_json::json;

    fn new_job(priority: i32, max_attempts: u32) -> Job {
        NewJob::new(JobType::file_ingest(), json!({"path": "a.pdf"}))
            .with_priority(priority)
            .with_max_attempts(max_attempts)
            .into_job(0, 3, Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let job = new_job(0, 3);
        store.enqueue(&job).await.unwrap();

        assert!(matches!(
            store.enqueue(&job).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let low_old = new_job(0, 3);
        let high = new_job(10, 3);
        let low_new = new_job(0, 3);
        for job in [&low_old, &high, &low_new] {
            store.enqueue(job).await.unwrap();
        }

        let claimed = store.claim_batch(2).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, low_old.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing && j.attempts == 1));

        let rest = store.claim_batch(5).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, low_new.id);

        assert!(store.claim_batch(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_claim_cannot_write() {
        let store = InMemoryJobStore::new();
        let job = new_job(0, 3);
        store.enqueue(&job).await.unwrap();

        let first = store.claim_batch(1).await.unwrap().remove(0);
        let old_claim = ClaimToken::of(&first);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = store.recover_stale(Duration::ZERO).await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);

        let second = store.claim_batch(1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 2);

        assert_eq!(store.complete(old_claim).await.unwrap(), JobOutcome::Lost);
        assert!(!store.renew_heartbeat(old_claim).await.unwrap());
        assert_eq!(
            store.complete(ClaimToken::of(&second)).await.unwrap(),
            JobOutcome::Completed
        );
    }

    #[tokio::test]
    async fn transitions_on_unknown_job_are_not_found() {
        let store = InMemoryJobStore::new();
        let claim = ClaimToken {
            job_id: JobId::new(),
            attempt: 1,
        };
        assert!(matches!(
            store.complete(claim).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recovery_respects_threshold_and_is_idempotent() {
        let store = InMemoryJobStore::new();
        store.enqueue(&new_job(0, 1)).await.unwrap();
        store.enqueue(&new_job(0, 3)).await.unwrap();
        store.claim_batch(2).await.unwrap();

        let fresh = store.recover_stale(Duration::from_secs(600)).await.unwrap();
        assert!(fresh.is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let first = store.recover_stale(Duration::ZERO).await.unwrap();
        assert_eq!(first.requeued.len(), 1);
        assert_eq!(first.failed.len(), 1);

        let second = store.recover_stale(Duration::ZERO).await.unwrap();
        assert!(second.is_empty());

        let failed = store.list_by_status(JobStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].heartbeat_at.is_none());
        assert!(failed[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn huge_threshold_recovers_nothing() {
        let store = InMemoryJobStore::new();
        store.enqueue(&new_job(0, 3)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        let report = store.recover_stale(Duration::MAX).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn progress_counts_jobs_in_scope() {
        let store = InMemoryJobStore::new();
        let app = ApplicationId::new();
        for _ in 0..3 {
            let job = NewJob::new(JobType::url_ingest(), json!({"url": "https://example.com"}))
                .with_context(JobContext::for_application(app))
                .into_job(0, 3, Utc::now())
                .unwrap();
            store.enqueue(&job).await.unwrap();
        }
        store.enqueue(&new_job(0, 3)).await.unwrap();

        let claimed = store.claim_batch(1).await.unwrap();
        let scope = ProgressScope::default().for_application(app);
        let before = store.progress(&scope).await.unwrap();

        let in_scope = claimed[0].context.application_id == Some(app);
        assert_eq!(before.total, 3);
        assert_eq!(before.processing, u64::from(in_scope));
        assert_eq!(before.pending, 3 - u64::from(in_scope));

        let all = store.progress(&ProgressScope::default()).await.unwrap();
        assert_eq!(all.total, 4);
    }
}

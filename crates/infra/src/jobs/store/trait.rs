use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use ingestq_core::{Job, JobId, JobProgress, JobStatus, ProgressScope};

use crate::jobs::types::{ClaimToken, JobOutcome, RecoveryReport};

/// Job store operation error.
///
/// Infrastructure failures only; handler failures never surface here.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to decode job row: {0}")]
    Decode(String),
}

/// Durable job storage.
///
/// Implementations must make each method a single atomic operation against the
/// backing store. Transitions that take a [`ClaimToken`] only apply while the
/// job is `processing` at the token's attempt and report [`JobOutcome::Lost`]
/// otherwise.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job.
    async fn enqueue(&self, job: &Job) -> Result<JobId, JobStoreError>;

    /// Get a job by id.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Oldest-first listing of jobs in one status.
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move up to `limit` pending jobs to `processing`, highest priority then
    /// oldest first, incrementing `attempts` and stamping `started_at` and
    /// `heartbeat_at`. Concurrent callers receive disjoint batches.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Set `heartbeat_at` to now. Returns `false` if the claim no longer holds.
    async fn renew_heartbeat(&self, claim: ClaimToken) -> Result<bool, JobStoreError>;

    /// `processing -> completed`.
    async fn complete(&self, claim: ClaimToken) -> Result<JobOutcome, JobStoreError>;

    /// Record a failed attempt: `pending` if attempts remain, else `failed`.
    async fn fail_attempt(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError>;

    /// `processing -> failed`, ignoring remaining attempts.
    async fn fail_permanently(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError>;

    /// Requeue or fail every `processing` job whose heartbeat is older than
    /// `threshold`. Never touches `attempts`.
    async fn recover_stale(&self, threshold: Duration) -> Result<RecoveryReport, JobStoreError>;

    /// Per-status counts for jobs in `scope`.
    async fn progress(&self, scope: &ProgressScope) -> Result<JobProgress, JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: &Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_batch(limit).await
    }

    async fn renew_heartbeat(&self, claim: ClaimToken) -> Result<bool, JobStoreError> {
        (**self).renew_heartbeat(claim).await
    }

    async fn complete(&self, claim: ClaimToken) -> Result<JobOutcome, JobStoreError> {
        (**self).complete(claim).await
    }

    async fn fail_attempt(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        (**self).fail_attempt(claim, error).await
    }

    async fn fail_permanently(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        (**self).fail_permanently(claim, error).await
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<RecoveryReport, JobStoreError> {
        (**self).recover_stale(threshold).await
    }

    async fn progress(&self, scope: &ProgressScope) -> Result<JobProgress, JobStoreError> {
        (**self).progress(scope).await
    }
}

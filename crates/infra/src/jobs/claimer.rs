//! Batch claiming of pending jobs.

use tracing::{debug, instrument};

use ingestq_core::Job;

use super::store::{JobStore, JobStoreError};

/// Claims pending jobs for this worker.
///
/// All mutual exclusion lives in [`JobStore::claim_batch`]; any number of
/// claimers in any number of processes may run against one store.
#[derive(Debug, Clone)]
pub struct Claimer<S: JobStore> {
    store: S,
    batch_size: usize,
}

impl<S: JobStore> Claimer<S> {
    pub fn new(store: S, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Claim up to the configured batch size.
    pub async fn claim(&self) -> Result<Vec<Job>, JobStoreError> {
        self.claim_up_to(self.batch_size).await
    }

    /// Claim up to `limit` jobs. A zero limit claims nothing and skips the
    /// store entirely.
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    pub async fn claim_up_to(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let jobs = self.store.claim_batch(limit).await?;
        tracing::Span::current().record("claimed", jobs.len());
        for job in &jobs {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "claimed job"
            );
        }
        Ok(jobs)
    }
}

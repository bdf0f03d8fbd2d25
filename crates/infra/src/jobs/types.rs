//! Queue-side types shared by the store, executor and orchestrator.

use serde::Serialize;

use ingestq_core::{Job, JobId};

/// Proof of a claim: the job id plus the attempt number it was claimed with.
///
/// Every write a worker makes after claiming (heartbeat, complete, fail) is
/// conditioned on the job still being `processing` at this attempt. Once stale
/// recovery hands the job to someone else the attempt number moves on and the
/// old token stops matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken {
    pub job_id: JobId,
    pub attempt: u32,
}

impl ClaimToken {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempts,
        }
    }
}

/// Result of recording a job's outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Now `completed`.
    Completed,
    /// Failed with attempts left; back to `pending`.
    Requeued,
    /// Now `failed` for good.
    Failed,
    /// The claim no longer matched (recovered and possibly re-claimed
    /// elsewhere); nothing was written.
    Lost,
}

/// What one stale-recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Returned to `pending`.
    pub requeued: Vec<JobId>,
    /// Out of attempts; moved to `failed`.
    pub failed: Vec<JobId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

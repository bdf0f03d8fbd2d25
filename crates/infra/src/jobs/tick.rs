//! One scheduled pass of the queue: recover, claim, execute.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use super::claimer::Claimer;
use super::executor::JobExecutor;
use super::recovery::StaleRecovery;
use super::store::{JobStore, JobStoreError};
use super::types::JobOutcome;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Stale jobs requeued or failed by recovery.
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Outcomes discarded because the claim was lost mid-run.
    pub lost: usize,
    /// Store errors hit along the way.
    pub errors: usize,
    /// True if the tick stopped early on an error.
    pub aborted: bool,
}

impl TickReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Requeued => self.requeued += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Lost => self.lost += 1,
        }
    }

    /// Jobs that reached any recorded outcome.
    pub fn finished(&self) -> usize {
        self.completed + self.requeued + self.failed + self.lost
    }
}

/// Drives a tick.
///
/// Steps run in order: stale recovery, claim one batch, execute the batch
/// concurrently and wait for every job. A recovery or claim error ends the
/// tick before anything is claimed. A store error while
/// recording one job's outcome does not affect the others; that job stays
/// `processing` until stale recovery picks it up.
pub struct TickOrchestrator<S: JobStore> {
    recovery: StaleRecovery<S>,
    claimer: Claimer<S>,
    executor: Arc<JobExecutor<S>>,
}

impl<S> TickOrchestrator<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(recovery: StaleRecovery<S>, claimer: Claimer<S>, executor: Arc<JobExecutor<S>>) -> Self {
        Self {
            recovery,
            claimer,
            executor,
        }
    }

    /// Run one tick. Never fails; problems show up in the report and logs.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        if let Err(e) = self.run(&mut report).await {
            error!(error = %e, "tick aborted");
            report.errors += 1;
            report.aborted = true;
        }

        info!(
            recovered = report.recovered,
            claimed = report.claimed,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            lost = report.lost,
            errors = report.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick finished"
        );
        report
    }

    async fn run(&self, report: &mut TickReport) -> Result<(), JobStoreError> {
        report.recovered = self.recovery.recover_stale().await?.total();

        let jobs = self.claimer.claim().await?;
        report.claimed = jobs.len();
        if jobs.is_empty() {
            return Ok(());
        }

        let mut running = JoinSet::new();
        for job in jobs {
            let executor = self.executor.clone();
            running.spawn(async move { executor.execute(job).await });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "failed to record job outcome");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "job task did not finish");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }
}

//! Runs claimed jobs through their handlers and records the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use ingestq_core::Job;

use super::heartbeat::Heartbeat;
use super::registry::{HandlerError, HandlerRegistry, HandlerResult, Invocation};
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimToken, JobOutcome};

/// Executes one claimed job at a time.
///
/// For each job: look up the handler, start a heartbeat, run the handler on
/// its own task, stop the heartbeat, then write the outcome under the job's
/// claim. Handler errors and panics become job failures; only store errors
/// are returned to the caller.
pub struct JobExecutor<S: JobStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    heartbeat_interval: Duration,
}

impl<S> JobExecutor<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S, registry: Arc<HandlerRegistry>, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            registry,
            heartbeat_interval,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run `job`, which must have been claimed by this worker.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts),
        err
    )]
    pub async fn execute(&self, job: Job) -> Result<JobOutcome, JobStoreError> {
        let claim = ClaimToken::of(&job);

        let Some(handler) = self.registry.get(&job.job_type) else {
            let reason = format!("no handler registered for job type '{}'", job.job_type);
            error!(%reason, "failing job");
            return self.store.fail_permanently(claim, &reason).await;
        };

        let heartbeat = Heartbeat::start(self.store.clone(), claim, self.heartbeat_interval);
        let started = Instant::now();

        let invocation = Invocation::from_job(&job);
        let mut task = HandlerTask(tokio::spawn(async move { handler.handle(invocation).await }));
        let result = match (&mut task.0).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Failed(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(HandlerError::Failed(format!("handler task aborted: {e}"))),
        };

        let renewals = heartbeat.stop().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => self.store.complete(claim).await?,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, elapsed_ms, "job attempt failed");
                self.store.fail_attempt(claim, &e.to_string()).await?
            }
            Err(e) => {
                error!(error = %e, elapsed_ms, "job failed permanently");
                self.store.fail_permanently(claim, &e.to_string()).await?
            }
        };

        match outcome {
            JobOutcome::Completed => info!(elapsed_ms, renewals, "job completed"),
            JobOutcome::Requeued => debug!("job requeued for another attempt"),
            JobOutcome::Failed => warn!("job failed"),
            JobOutcome::Lost => warn!("claim lost before the outcome was recorded; result discarded"),
        }
        Ok(outcome)
    }
}

/// Aborts the handler task if `execute` is dropped before it finishes.
struct HandlerTask(JoinHandle<HandlerResult>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

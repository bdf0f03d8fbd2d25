//! The queue's public face: enqueue, progress, tick.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use ingestq_core::{DomainError, Job, JobId, JobProgress, NewJob, ProgressScope};

use super::claimer::Claimer;
use super::config::{ConfigError, QueueConfig};
use super::executor::JobExecutor;
use super::recovery::StaleRecovery;
use super::registry::HandlerRegistry;
use super::store::{JobStore, JobStoreError};
use super::tick::{TickOrchestrator, TickReport};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The job was rejected before reaching the store.
    #[error("invalid job: {0}")]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A job queue bound to one store and one handler registry.
///
/// Producers call [`enqueue`](Self::enqueue); a scheduler calls
/// [`tick`](Self::tick) on an interval. Many `JobQueue`s, in one process or
/// many, may share the same backing table.
pub struct JobQueue<S: JobStore> {
    store: S,
    config: QueueConfig,
    orchestrator: TickOrchestrator<S>,
}

impl<S> JobQueue<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S, registry: HandlerRegistry, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let executor = JobExecutor::new(store.clone(), Arc::new(registry), config.heartbeat_interval);
        let orchestrator = TickOrchestrator::new(
            StaleRecovery::new(store.clone(), config.stale_threshold),
            Claimer::new(store.clone(), config.batch_size),
            Arc::new(executor),
        );

        Ok(Self {
            store,
            config,
            orchestrator,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a job as `pending`, filling in the configured defaults for
    /// priority and max attempts.
    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type), err)]
    pub async fn enqueue(&self, new_job: NewJob) -> Result<JobId, QueueError> {
        let job = new_job.into_job(
            self.config.default_priority,
            self.config.default_max_attempts,
            Utc::now(),
        )?;
        let id = self.store.enqueue(&job).await?;
        info!(job_id = %id, priority = job.priority, max_attempts = job.max_attempts, "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Counts per status for jobs in `scope`.
    pub async fn get_progress(&self, scope: &ProgressScope) -> Result<JobProgress, QueueError> {
        Ok(self.store.progress(scope).await?)
    }

    /// Run one recover/claim/execute pass.
    pub async fn tick(&self) -> TickReport {
        self.orchestrator.tick().await
    }
}

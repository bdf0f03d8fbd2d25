//! Aggregate progress counts for a group of jobs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ApplicationId, ResourceId};
use crate::job::{Job, JobStatus};

/// Which jobs a progress query covers. Unset filters match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressScope {
    pub application_id: Option<ApplicationId>,
    pub resource_id: Option<ResourceId>,
    /// Only jobs created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
}

impl ProgressScope {
    /// Jobs created within the last `window`.
    pub fn recent(window: Duration) -> Self {
        Self {
            created_after: Some(Utc::now() - window),
            ..Default::default()
        }
    }

    pub fn for_application(mut self, application_id: ApplicationId) -> Self {
        self.application_id = Some(application_id);
        self
    }

    pub fn for_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.application_id
            .is_none_or(|id| job.context.application_id == Some(id))
            && self
                .resource_id
                .is_none_or(|id| job.context.resource_id == Some(id))
            && self.created_after.is_none_or(|after| job.created_at >= after)
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobProgress {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        self.total += count;
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// True once nothing in scope is pending or processing.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobType, NewJob};

    #[test]
    fn counts_by_status() {
        let mut progress = JobProgress::default();
        progress.record(JobStatus::Pending);
        progress.record(JobStatus::Completed);
        progress.add(JobStatus::Failed, 2);

        assert_eq!(progress.total, 4);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 2);
        assert!(!progress.is_finished());
    }

    #[test]
    fn scope_filters_on_context_and_age() {
        let app = ApplicationId::new();
        let job = NewJob::new(JobType::file_ingest(), serde_json::json!({}))
            .with_context(JobContext::for_application(app))
            .into_job(0, 3, Utc::now())
            .unwrap();

        assert!(ProgressScope::default().matches(&job));
        assert!(ProgressScope::recent(Duration::hours(1)).for_application(app).matches(&job));
        assert!(!ProgressScope::default().for_application(ApplicationId::new()).matches(&job));
        assert!(!ProgressScope::default().for_resource(ResourceId::new()).matches(&job));

        let future = ProgressScope {
            created_after: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        };
        assert!(!future.matches(&job));
    }
}

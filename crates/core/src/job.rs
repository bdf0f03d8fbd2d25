//! Job record, status state machine and enqueue input.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ApplicationId, JobId, ResourceId, UserId};

/// `last_error` written when stale recovery puts a job back in the pool.
pub const STALE_REQUEUED_ERROR: &str = "heartbeat expired; job requeued by stale recovery";

/// `last_error` written when stale recovery finds no attempts left.
pub const STALE_EXHAUSTED_ERROR: &str =
    "heartbeat expired; max attempts exceeded during stale recovery";

const MAX_JOB_TYPE_LEN: usize = 64;

/// Lifecycle status of a job.
///
/// `Pending` and `Processing` are the only non-terminal states.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Permanently failed; no further automatic retries.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Tag selecting the handler for a job.
///
/// Open-ended on purpose: a job may carry a type nobody registered a handler
/// for, in which case execution fails it permanently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobType(String);

impl JobType {
    pub const FILE_INGEST: &'static str = "file_ingest";
    pub const URL_INGEST: &'static str = "url_ingest";
    pub const CRAWL_PAGE_INGEST: &'static str = "crawl_page_ingest";

    /// Parse and validate a type tag.
    ///
    /// Tags are 1..=64 chars of `[a-z0-9_.-]`.
    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        if tag.len() > MAX_JOB_TYPE_LEN {
            return Err(DomainError::validation(format!(
                "job type longer than {MAX_JOB_TYPE_LEN} characters"
            )));
        }
        if let Some(bad) = tag
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.')))
        {
            return Err(DomainError::validation(format!(
                "job type '{tag}' contains invalid character '{bad}'"
            )));
        }
        Ok(Self(tag))
    }

    pub fn file_ingest() -> Self {
        Self(Self::FILE_INGEST.to_string())
    }

    pub fn url_ingest() -> Self {
        Self(Self::URL_INGEST.to_string())
    }

    pub fn crawl_page_ingest() -> Self {
        Self(Self::CRAWL_PAGE_INGEST.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.0
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Pass-through context copied into every handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub application_id: Option<ApplicationId>,
    pub resource_id: Option<ResourceId>,
    pub user_id: Option<UserId>,
    /// Handler-specific configuration (chunking options, crawl limits, ...).
    pub config: Option<serde_json::Value>,
}

impl JobContext {
    pub fn for_application(application_id: ApplicationId) -> Self {
        Self {
            application_id: Some(application_id),
            ..Default::default()
        }
    }

    pub fn with_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// Producer-side input for `enqueue`.
///
/// Priority and max attempts fall back to queue defaults when unset.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub context: JobContext,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: None,
            max_attempts: None,
            context: JobContext::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }

    /// Validate and turn into a fresh `pending` job record.
    pub fn into_job(
        self,
        default_priority: i32,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Job> {
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if max_attempts > i32::MAX as u32 {
            return Err(DomainError::validation("max_attempts out of range"));
        }
        if self.payload.is_null() {
            return Err(DomainError::validation("payload must not be null"));
        }

        Ok(Job {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            priority: self.priority.unwrap_or(default_priority),
            attempts: 0,
            max_attempts,
            started_at: None,
            heartbeat_at: None,
            completed_at: None,
            last_error: None,
            context: self.context,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher claims first.
    pub priority: i32,
    /// Number of claims so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `status == Processing`.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub context: JobContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the heartbeat is older than `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.heartbeat_at.is_some_and(|at| at < stale_before)
    }

    /// Whether this job is still held under the given claim.
    pub fn is_held_by(&self, attempt: u32) -> bool {
        self.status == JobStatus::Processing && self.attempts == attempt
    }

    /// `pending -> processing`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn renew_heartbeat(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invalid_transition(format!(
                "heartbeat on {} job",
                self.status
            )));
        }
        self.heartbeat_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.heartbeat_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt: back to `pending` while attempts remain,
    /// otherwise `failed`. Returns the resulting status.
    pub fn fail_attempt(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<JobStatus> {
        if self.has_attempts_left() {
            self.requeue(error, now)?;
        } else {
            self.fail(error, now)?;
        }
        Ok(self.status)
    }

    /// `processing -> failed`, regardless of remaining attempts.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.heartbeat_at = None;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// Stale recovery: requeue with the stale marker, or fail once attempts
    /// are used up. Attempts are left untouched.
    pub fn recover_stale(&mut self, now: DateTime<Utc>) -> DomainResult<JobStatus> {
        if self.has_attempts_left() {
            self.requeue(STALE_REQUEUED_ERROR, now)?;
        } else {
            self.fail(STALE_EXHAUSTED_ERROR, now)?;
        }
        Ok(self.status)
    }

    fn requeue(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.heartbeat_at = None;
        self.last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    fn ensure_transition(&self, next: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )))
        }
    }
}

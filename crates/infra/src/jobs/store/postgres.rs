//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_batch` is a single statement: a `MATERIALIZED` CTE picks up to
//! `limit` ids with `FOR UPDATE SKIP LOCKED`, and the `UPDATE` joins on it.
//! The CTE runs exactly once, so the batch never exceeds `limit` whatever
//! plan Postgres picks. Rows another transaction is already claiming are
//! skipped rather than waited on, so concurrent workers each walk away with a
//! disjoint batch and never block behind each other. Stale recovery selects
//! its rows the same way.
//!
//! ## Fencing
//!
//! Heartbeat, complete and fail statements carry
//! `status = 'processing' AND attempts = $n`. Zero rows affected means the
//! claim was lost to stale recovery and the write is dropped.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue) / `Storage` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! Rows that fail to convert into a `Job` (unknown status, bad type tag)
//! surface as `Decode`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use ingestq_core::job::{STALE_EXHAUSTED_ERROR, STALE_REQUEUED_ERROR};
use ingestq_core::{
    ApplicationId, Job, JobContext, JobId, JobProgress, JobStatus, JobType, ProgressScope,
    ResourceId, UserId,
};

use super::r#trait::{JobStore, JobStoreError};
use crate::jobs::types::{ClaimToken, JobOutcome, RecoveryReport};

macro_rules! job_columns {
    () => {
        "id, job_type, payload, status, priority, attempts, max_attempts, \
         started_at, heartbeat_at, completed_at, last_error, \
         application_id, resource_id, user_id, config, created_at, updated_at"
    };
}

/// Postgres-backed job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a store over an existing pool. The schema must already exist
    /// (see [`crate::jobs::schema::apply`]).
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a fenced single-row transition and map its `RETURNING status`.
    async fn fenced_transition(
        &self,
        operation: &'static str,
        sql: &'static str,
        claim: ClaimToken,
        error: Option<&str>,
    ) -> Result<JobOutcome, JobStoreError> {
        let mut query = sqlx::query(sql)
            .bind(claim.job_id.as_uuid())
            .bind(attempt_to_db(claim.attempt)?);
        if let Some(error) = error {
            query = query.bind(error);
        }

        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            return Ok(JobOutcome::Lost);
        };

        let status: String = row
            .try_get("status")
            .map_err(|e| JobStoreError::Decode(format!("status: {e}")))?;
        outcome_for_status(&status)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn enqueue(&self, job: &Job) -> Result<JobId, JobStoreError> {
        sqlx::query(concat!(
            "INSERT INTO ingest_jobs (",
            job_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(attempt_to_db(job.attempts)?)
        .bind(attempt_to_db(job.max_attempts)?)
        .bind(job.started_at)
        .bind(job.heartbeat_at)
        .bind(job.completed_at)
        .bind(job.last_error.as_deref())
        .bind(job.context.application_id.map(Uuid::from))
        .bind(job.context.resource_id.map(Uuid::from))
        .bind(job.context.user_id.map(Uuid::from))
        .bind(job.context.config.clone())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self, job_id), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM ingest_jobs WHERE id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM ingest_jobs WHERE status = $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit_to_db(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(concat!(
            r#"
            WITH picked AS MATERIALIZED (
                SELECT id AS picked_id
                FROM ingest_jobs
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = NOW(),
                heartbeat_at = NOW(),
                updated_at = NOW()
            FROM picked
            WHERE id = picked.picked_id
              AND status = 'pending'
            RETURNING "#,
            job_columns!()
        ))
        .bind(limit_to_db(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; hand jobs out in claim order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, claim), fields(job_id = %claim.job_id, attempt = claim.attempt), err)]
    async fn renew_heartbeat(&self, claim: ClaimToken) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(claim.job_id.as_uuid())
        .bind(attempt_to_db(claim.attempt)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_heartbeat", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim), fields(job_id = %claim.job_id, attempt = claim.attempt), err)]
    async fn complete(&self, claim: ClaimToken) -> Result<JobOutcome, JobStoreError> {
        self.fenced_transition(
            "complete",
            r#"
            UPDATE ingest_jobs
            SET status = 'completed',
                heartbeat_at = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            RETURNING status
            "#,
            claim,
            None,
        )
        .await
    }

    #[instrument(skip(self, claim, error), fields(job_id = %claim.job_id, attempt = claim.attempt), err)]
    async fn fail_attempt(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        self.fenced_transition(
            "fail_attempt",
            r#"
            UPDATE ingest_jobs
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                started_at = CASE WHEN attempts < max_attempts THEN NULL ELSE started_at END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                heartbeat_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            RETURNING status
            "#,
            claim,
            Some(error),
        )
        .await
    }

    #[instrument(skip(self, claim, error), fields(job_id = %claim.job_id, attempt = claim.attempt), err)]
    async fn fail_permanently(&self, claim: ClaimToken, error: &str) -> Result<JobOutcome, JobStoreError> {
        self.fenced_transition(
            "fail_permanently",
            r#"
            UPDATE ingest_jobs
            SET status = 'failed',
                heartbeat_at = NULL,
                completed_at = NOW(),
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            RETURNING status
            "#,
            claim,
            Some(error),
        )
        .await
    }

    #[instrument(skip(self), fields(recovered = tracing::field::Empty), err)]
    async fn recover_stale(&self, threshold: Duration) -> Result<RecoveryReport, JobStoreError> {
        let rows = sqlx::query(
            r#"
            WITH stale AS MATERIALIZED (
                SELECT id AS stale_id
                FROM ingest_jobs
                WHERE status = 'processing'
                  AND heartbeat_at < NOW() - make_interval(secs => $1)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_jobs
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                started_at = CASE WHEN attempts < max_attempts THEN NULL ELSE started_at END,
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                last_error = CASE WHEN attempts < max_attempts THEN $2 ELSE $3 END,
                heartbeat_at = NULL,
                updated_at = NOW()
            FROM stale
            WHERE id = stale.stale_id
              AND status = 'processing'
            RETURNING id, status
            "#,
        )
        .bind(threshold.as_secs_f64())
        .bind(STALE_REQUEUED_ERROR)
        .bind(STALE_EXHAUSTED_ERROR)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let mut report = RecoveryReport::default();
        for row in rows {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| JobStoreError::Decode(format!("id: {e}")))?;
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Decode(format!("status: {e}")))?;
            match outcome_for_status(&status)? {
                JobOutcome::Requeued => report.requeued.push(JobId::from_uuid(id)),
                _ => report.failed.push(JobId::from_uuid(id)),
            }
        }
        report.requeued.sort();
        report.failed.sort();

        Span::current().record("recovered", report.total());
        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn progress(&self, scope: &ProgressScope) -> Result<JobProgress, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM ingest_jobs
            WHERE ($1::uuid IS NULL OR application_id = $1)
              AND ($2::uuid IS NULL OR resource_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            GROUP BY status
            "#,
        )
        .bind(scope.application_id.map(Uuid::from))
        .bind(scope.resource_id.map(Uuid::from))
        .bind(scope.created_after)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("progress", e))?;

        let mut progress = JobProgress::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Decode(format!("status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Decode(format!("count: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            progress.add(status, count.max(0) as u64);
        }
        Ok(progress)
    }
}

fn outcome_for_status(status: &str) -> Result<JobOutcome, JobStoreError> {
    match status
        .parse::<JobStatus>()
        .map_err(|e| JobStoreError::Decode(e.to_string()))?
    {
        JobStatus::Completed => Ok(JobOutcome::Completed),
        JobStatus::Pending => Ok(JobOutcome::Requeued),
        JobStatus::Failed => Ok(JobOutcome::Failed),
        JobStatus::Processing => Err(JobStoreError::Decode(
            "transition left job in processing".to_string(),
        )),
    }
}

fn attempt_to_db(value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value).map_err(|_| JobStoreError::Storage(format!("attempt count {value} out of range")))
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row).map_err(|e| JobStoreError::Decode(e.to_string()))?;
    Job::try_from(row)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out acquiring connection in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    application_id: Option<Uuid>,
    resource_id: Option<Uuid>,
    user_id: Option<Uuid>,
    config: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            started_at: row.try_get("started_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            application_id: row.try_get("application_id")?,
            resource_id: row.try_get("resource_id")?,
            user_id: row.try_get("user_id")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let decode = |e: ingestq_core::DomainError| JobStoreError::Decode(format!("job {id}: {e}"));
        let count = |field: &str, value: i32| {
            u32::try_from(value)
                .map_err(|_| JobStoreError::Decode(format!("job {id}: negative {field}")))
        };

        Ok(Job {
            id: JobId::from_uuid(id),
            job_type: JobType::new(row.job_type).map_err(decode)?,
            status: row.status.parse().map_err(decode)?,
            priority: row.priority,
            attempts: count("attempts", row.attempts)?,
            max_attempts: count("max_attempts", row.max_attempts)?,
            started_at: row.started_at,
            heartbeat_at: row.heartbeat_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            context: JobContext {
                application_id: row.application_id.map(ApplicationId::from_uuid),
                resource_id: row.resource_id.map(ResourceId::from_uuid),
                user_id: row.user_id.map(UserId::from_uuid),
                config: row.config,
            },
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

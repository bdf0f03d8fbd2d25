//! Database schema bootstrap.

use sqlx::PgPool;
use tracing::info;

use super::store::JobStoreError;

/// DDL for the `ingest_jobs` table and its indexes. Idempotent.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_ingest_jobs.sql");

/// Create the job table and indexes if they do not exist yet.
pub async fn apply(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to apply schema: {e}")))?;
    info!("ingest_jobs schema ready");
    Ok(())
}

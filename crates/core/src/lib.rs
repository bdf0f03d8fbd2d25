//! `ingestq-core`: domain building blocks for the ingestion job queue.
//!
//! This crate contains **pure domain** primitives (no storage, no async).
//! Persistence and execution live in `ingestq-infra`.

pub mod error;
pub mod id;
pub mod job;
pub mod progress;

pub use error::{DomainError, DomainResult};
pub use id::{ApplicationId, JobId, ResourceId, UserId};
pub use job::{
    Job, JobContext, JobStatus, JobType, NewJob, STALE_EXHAUSTED_ERROR, STALE_REQUEUED_ERROR,
};
pub use progress::{JobProgress, ProgressScope};

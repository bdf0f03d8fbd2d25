//! Infrastructure layer: Postgres storage and job execution for the queue.

pub mod jobs;

pub use jobs::{
    HandlerRegistry, InMemoryJobStore, JobQueue, JobStore, PostgresJobStore, QueueConfig,
    TickReport,
};

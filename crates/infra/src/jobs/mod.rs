//! Durable job queue.
//!
//! ## Lifecycle
//!
//! ```text
//! pending --claim--> processing --complete--> completed
//!    ^                   |
//!    +---fail/recover----+--fail (no attempts left)--> failed
//! ```
//!
//! Producers add jobs with [`JobQueue::enqueue`]. Each worker calls
//! [`JobQueue::tick`] on a schedule; a tick recovers abandoned jobs, claims a
//! batch with `FOR UPDATE SKIP LOCKED`, and runs the batch while a heartbeat
//! keeps every claim fresh.
//!
//! ## Components
//!
//! - [`JobStore`]: persistence (Postgres or in-memory)
//! - [`Claimer`]: batch claiming
//! - [`Heartbeat`]: per-job liveness renewal
//! - [`StaleRecovery`]: requeues jobs whose worker went away
//! - [`JobExecutor`]: handler dispatch and outcome recording
//! - [`TickOrchestrator`]: one recover/claim/execute pass

pub mod claimer;
pub mod config;
pub mod executor;
pub mod heartbeat;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod schema;
pub mod store;
pub mod tick;
pub mod types;

pub use claimer::Claimer;
pub use config::{ConfigError, QueueConfig};
pub use executor::JobExecutor;
pub use heartbeat::Heartbeat;
pub use queue::{JobQueue, QueueError};
pub use recovery::StaleRecovery;
pub use registry::{
    FnHandler, HandlerError, HandlerRegistry, HandlerResult, Invocation, JobHandler, Typed,
    TypedJobHandler,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
pub use tick::{TickOrchestrator, TickReport};
pub use types::{ClaimToken, JobOutcome, RecoveryReport};

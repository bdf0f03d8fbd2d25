//! `ingestq-worker`: runs the job queue against Postgres on a fixed tick.

pub mod config;
pub mod handlers;
pub mod runner;

pub use config::WorkerConfig;
pub use handlers::{HttpForwardHandler, register_ingest_handlers};
pub use runner::run_until;

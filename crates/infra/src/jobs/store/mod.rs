//! Job persistence.
//!
//! `JobStore` is the only shared mutable resource in the queue. Every status
//! change is one atomic, status-conditioned operation, so workers in different
//! processes coordinate through the store alone.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStore, JobStoreError};

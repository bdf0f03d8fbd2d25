//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use ingestq_core::{Job, JobContext, JobId, JobType};

/// What a handler sees of the job it is running.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based; equals the job's `attempts` after the claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub context: JobContext,
}

impl Invocation {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            payload: job.payload.clone(),
            context: job.context.clone(),
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handler failure.
///
/// `Failed` consumes one attempt and may be retried. `Permanent` and
/// `InvalidPayload` fail the job immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Runs one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, invocation: Invocation) -> HandlerResult;
}

/// Adapter for plain async closures.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, invocation: Invocation) -> HandlerResult {
        (self.f)(invocation).await
    }
}

/// A handler that wants its payload deserialized first.
#[async_trait]
pub trait TypedJobHandler: Send + Sync {
    type Payload: DeserializeOwned + Send + 'static;

    async fn handle(&self, payload: Self::Payload, invocation: Invocation) -> HandlerResult;
}

/// Wraps a [`TypedJobHandler`]; payloads that do not deserialize fail with
/// [`HandlerError::InvalidPayload`] without reaching the handler.
pub struct Typed<H>(pub H);

#[async_trait]
impl<H> JobHandler for Typed<H>
where
    H: TypedJobHandler,
{
    async fn handle(&self, invocation: Invocation) -> HandlerResult {
        let payload = serde_json::from_value::<H::Payload>(invocation.payload.clone())
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        self.0.handle(payload, invocation).await
    }
}

/// Maps job types to handlers. Registering a type twice replaces the first
/// handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, f: F) -> &mut Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(job_type, FnHandler::new(f))
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ingestq_core::NewJob;
    use serde::Deserialize;
    use serde_json::json;

    fn invocation(payload: serde_json::Value) -> Invocation {
        let mut job = NewJob::new(JobType::url_ingest(), payload)
            .into_job(0, 2, Utc::now())
            .unwrap();
        job.claim(Utc::now()).unwrap();
        Invocation::from_job(&job)
    }

    #[derive(Deserialize)]
    struct UrlPayload {
        url: String,
    }

    struct RequireHttps;

    #[async_trait]
    impl TypedJobHandler for RequireHttps {
        type Payload = UrlPayload;

        async fn handle(&self, payload: UrlPayload, _invocation: Invocation) -> HandlerResult {
            if payload.url.starts_with("https://") {
                Ok(())
            } else {
                Err(HandlerError::permanent("only https urls are accepted"))
            }
        }
    }

    #[test]
    fn invocation_reflects_claimed_job() {
        let inv = invocation(json!({"url": "https://example.com"}));
        assert_eq!(inv.attempt, 1);
        assert_eq!(inv.max_attempts, 2);
        assert!(!inv.is_last_attempt());
    }

    #[tokio::test]
    async fn lookup_by_job_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(JobType::file_ingest(), |_| async { Ok(()) })
            .register(JobType::url_ingest(), Typed(RequireHttps));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.job_types(), vec![JobType::file_ingest(), JobType::url_ingest()]);
        assert!(registry.get(&JobType::crawl_page_ingest()).is_none());

        let handler = registry.get(&JobType::file_ingest()).unwrap();
        assert_eq!(handler.handle(invocation(json!({}))).await, Ok(()));
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = Typed(RequireHttps);

        assert_eq!(handler.handle(invocation(json!({"url": "https://a.example"}))).await, Ok(()));
        assert!(matches!(
            handler.handle(invocation(json!({"url": "http://a.example"}))).await,
            Err(HandlerError::Permanent(_))
        ));
        assert!(matches!(
            handler.handle(invocation(json!({"path": "x"}))).await,
            Err(HandlerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn only_plain_failures_are_retryable() {
        assert!(HandlerError::failed("timeout").is_retryable());
        assert!(!HandlerError::permanent("bad").is_retryable());
        assert!(!HandlerError::InvalidPayload("bad".into()).is_retryable());
    }
}

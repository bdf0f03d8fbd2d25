//! Handlers that hand ingestion work to the ingestion service over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use ingestq_core::{JobContext, JobId, JobType};
use ingestq_infra::jobs::{HandlerError, HandlerRegistry, HandlerResult, Invocation, JobHandler};

/// Request body sent for every forwarded job.
#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    job_id: JobId,
    job_type: &'a JobType,
    attempt: u32,
    payload: &'a serde_json::Value,
    context: &'a JobContext,
}

/// POSTs each job to `{endpoint}/{job_type}`.
///
/// 2xx completes the job. 4xx fails it permanently, except 408 and 429 which
/// are worth retrying. Anything else, including transport errors, is a
/// retryable failure.
#[derive(Debug, Clone)]
pub struct HttpForwardHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpForwardHandler {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, job_type: &JobType) -> String {
        format!("{}/{}", self.endpoint, job_type)
    }
}

#[async_trait]
impl JobHandler for HttpForwardHandler {
    async fn handle(&self, invocation: Invocation) -> HandlerResult {
        let url = self.url_for(&invocation.job_type);
        let body = ForwardRequest {
            job_id: invocation.job_id,
            job_type: &invocation.job_type,
            attempt: invocation.attempt,
            payload: &invocation.payload,
            context: &invocation.context,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::failed(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(job_id = %invocation.job_id, %status, "ingestion service accepted job");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("ingestion service returned {status}: {}", truncate(&detail, 512));
        let permanent = status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS;

        if permanent {
            Err(HandlerError::Permanent(message))
        } else {
            Err(HandlerError::Failed(message))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Register the forwarding handler for every ingestion job type.
pub fn register_ingest_handlers(registry: &mut HandlerRegistry, handler: HttpForwardHandler) {
    for job_type in [
        JobType::file_ingest(),
        JobType::url_ingest(),
        JobType::crawl_page_ingest(),
    ] {
        registry.register(job_type, handler.clone());
    }
}

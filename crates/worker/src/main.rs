use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use ingestq_infra::jobs::{HandlerRegistry, JobQueue, PostgresJobStore, schema};
use ingestq_worker::{HttpForwardHandler, WorkerConfig, register_ingest_handlers, run_until};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    ingestq_observability::init_with(config.log_format);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    schema::apply(&pool).await.context("failed to apply job schema")?;

    let mut registry = HandlerRegistry::new();
    let forward = HttpForwardHandler::new(config.ingest_endpoint.clone())
        .context("failed to build HTTP client")?;
    register_ingest_handlers(&mut registry, forward);

    let store = Arc::new(PostgresJobStore::new(pool));
    let queue = JobQueue::new(store, registry, config.queue.clone())?;

    info!(
        worker = %config.queue.worker_name,
        tick_secs = config.tick_interval.as_secs(),
        batch_size = config.queue.batch_size,
        endpoint = %config.ingest_endpoint,
        "worker started"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c; shutting down");
        }
    };
    let ticks = run_until(&queue, config.tick_interval, shutdown).await;

    info!(ticks, "worker stopped");
    Ok(())
}

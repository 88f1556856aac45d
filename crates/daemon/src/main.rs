use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use credflow_daemon::{build_pipeline, Config, Pipeline};
use credflow_infra::{
    InMemoryEventStore, InMemoryRequestStore, PostgresEventStore, PostgresRequestStore,
    SchedulerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    credflow_observability::init();

    let config = Config::from_env();
    tracing::info!(
        chunk_size = config.chunk_size,
        store_job_secs = config.store_job_interval.as_secs(),
        retrigger_job_secs = config.retrigger_job_interval.as_secs(),
        persistent = config.database_url.is_some(),
        "starting credential pipeline daemon"
    );

    let Pipeline {
        scheduler,
        executor,
    } = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let runtime = tokio::runtime::Handle::current();
            let events = Arc::new(PostgresEventStore::new(pool.clone(), runtime.clone()));
            let requests = Arc::new(PostgresRequestStore::new(pool, runtime));
            build_pipeline(events, requests, &config)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            let events = Arc::new(InMemoryEventStore::new());
            let requests = Arc::new(InMemoryRequestStore::new());
            build_pipeline(events, requests, &config)
        }
    };

    let handle = scheduler.spawn(SchedulerConfig::default());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    // Stop the timer first, then drain the pool; a run already in flight
    // finishes its items inline once the queue closes.
    handle.shutdown();
    executor.shutdown();
    Ok(())
}

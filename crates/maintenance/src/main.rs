use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;

use sitesafe_queue::jobs::sub_duration;
use sitesafe_queue::{CleanupWorker, JobStore, PostgresJobStore, QueueConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sitesafe_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;

    let store = Arc::new(PostgresJobStore::new(pool));
    store.migrate().await.context("failed to apply job migrations")?;
    tracing::info!("job schema up to date");

    // Jobs held in processing longer than a handler may run were likely
    // orphaned by a crashed worker.
    let cutoff = sub_duration(Utc::now(), config.worker.job_timeout);
    let stalled = store.list_stalled(cutoff).await?;
    if !stalled.is_empty() {
        tracing::warn!(count = stalled.len(), %cutoff, "stalled jobs found in processing");
        for job in &stalled {
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                organization_id = %job.organization_id,
                started_at = ?job.started_at,
                "stalled job"
            );
        }
    }

    let cleanup = CleanupWorker::spawn(store, config.cleanup.clone())?;
    tracing::info!(
        interval_secs = config.cleanup.interval.as_secs(),
        retention_secs = config.cleanup.retention.as_secs(),
        "cleanup worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    let deleted = cleanup.shutdown().await;
    tracing::info!(deleted, "cleanup worker stopped");
    Ok(())
}

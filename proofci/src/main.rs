use std::sync::Arc;

use proofci::config::AppConfig;
use proofci::database::{self, repositories::SqlxJobRepository};
use proofci::engine::{
    ConcurrencyLimiter, JobPurgeService, JobStore, RetryController, SandboxExecutor, Scheduler,
};
use proofci::logging::init_logging;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Hold the guard until exit so buffered log lines reach the file.
    let (_log_handle, _log_guard) = init_logging(&config.logging)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let store = Arc::new(JobStore::new(
        Arc::new(SqlxJobRepository::new(pool)),
        RetryController::new(config.retry.clone()),
        config.security.clone(),
    )
    .with_queue_config(&config.queue));

    let recovered = store.recover_orphaned().await?;
    if recovered > 0 {
        tracing::warn!("Returned {} orphaned running jobs to pending", recovered);
    }

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::with_cancellation(
        Arc::clone(&store),
        Arc::new(ConcurrencyLimiter::new(&config.limits)),
        Arc::new(SandboxExecutor::new(config.executor.clone())),
        config.scheduler.clone(),
        shutdown.child_token(),
    ));
    let scheduler_handle = scheduler.start();

    let purge = Arc::new(JobPurgeService::new(config.purge.clone(), store));
    let purge_handle = purge.start_background_task(shutdown.child_token());

    tracing::info!("proofci started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, stopping in-flight attempts");
    shutdown.cancel();

    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    if let Err(e) = purge_handle.await {
        tracing::error!("Purge task failed: {}", e);
    }

    tracing::info!("proofci stopped");
    Ok(())
}

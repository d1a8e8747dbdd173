//! `taskbroker-sweeper` -- queue maintenance daemon.
//!
//! Returns stale running jobs to pending, deletes expired completed and
//! cancelled jobs, and logs per-queue statistics on every sweep.
//!
//! # Environment variables
//!
//! | Variable               | Default                     |
//! |------------------------|-----------------------------|
//! | `MONGODB_URI`          | `mongodb://localhost:27017` |
//! | `MONGODB_DATABASE`     | `taskbroker`                |
//! | `JOBS_COLLECTION`      | `jobs`                      |
//! | `STALE_THRESHOLD_SECS` | `300`                       |
//! | `RETENTION_DAYS`       | `30` (`0` keeps jobs)       |
//! | `SWEEP_INTERVAL_SECS`  | `60`                        |
//!
//! Pass `--once` to run a single sweep and exit.

use anyhow::Context;
use tokio::time::MissedTickBehavior;

use taskbroker_infra::QueueConfig;
use taskbroker_infra::jobs::{JobQueue, MongoJobStore, QueueInspector, Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    taskbroker_observability::init();

    let config = QueueConfig::from_env().context("invalid configuration")?;
    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    tracing::info!(
        database = %config.database,
        collection = %config.collection,
        stale_threshold_secs = config.stale_threshold.as_secs(),
        retention_days = config.retention.map(|r| r.as_secs() / 86_400),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        once,
        "starting taskbroker-sweeper",
    );

    let store = MongoJobStore::connect(&config.mongodb_uri, &config.database, &config.collection)
        .await
        .context("failed to connect to MongoDB")?;
    store
        .ensure_indexes()
        .await
        .context("failed to create job indexes")?;

    let queue = JobQueue::new(store.clone());
    let inspector = QueueInspector::new(store);
    let sweeper = Sweeper::new(queue, config.sweeper());

    if once {
        let report = sweeper.run_once().await.context("sweep failed")?;
        tracing::info!(stale_reset = report.stale_reset, deleted = report.deleted, "sweep finished");
        log_queue_stats(&inspector).await;
        return Ok(());
    }

    let handle = sweeper.spawn();

    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_queue_stats(&inspector).await,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn log_queue_stats(inspector: &QueueInspector<MongoJobStore>) {
    match inspector.all_queue_stats().await {
        Ok(all) => {
            for stats in all {
                tracing::info!(
                    queue = %stats.queue_name,
                    pending = stats.pending,
                    running = stats.running,
                    completed = stats.completed,
                    failed = stats.failed,
                    cancelled = stats.cancelled,
                    oldest_pending_age_secs = stats.oldest_pending_age.map(|a| a.as_secs()),
                    "queue stats",
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to read queue stats"),
    }
}

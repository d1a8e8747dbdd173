//! Periodic maintenance: stale-running recovery and retention cleanup.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use taskbroker_core::QueueResult;
use taskbroker_core::clock::earlier_by;

use super::queue::JobQueue;
use super::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Running jobs started longer ago than this go back to pending.
    pub stale_threshold: Duration,
    /// Completed and cancelled jobs finished longer ago than this are deleted.
    /// `None` keeps them forever.
    pub retention: Option<Duration>,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300),
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_reset: u64,
    pub deleted: u64,
}

pub struct Sweeper<S: JobStore> {
    queue: JobQueue<S>,
    config: SweeperConfig,
}

impl<S: JobStore + 'static> Sweeper<S> {
    pub fn new(queue: JobQueue<S>, config: SweeperConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// One stale-recovery pass followed by one retention pass.
    pub async fn run_once(&self) -> QueueResult<SweepReport> {
        let stale_reset = self
            .queue
            .cleanup_stale_running(self.config.stale_threshold)
            .await?;

        let deleted = match self.config.retention {
            Some(retention) => {
                let cutoff = earlier_by(self.queue.now(), retention);
                self.queue.delete_older_than(cutoff).await?
            }
            None => 0,
        };

        Ok(SweepReport {
            stale_reset,
            deleted,
        })
    }

    /// Sweep every `interval` until the handle is shut down.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match self.run_once().await {
                    Ok(report) => debug!(
                        stale_reset = report.stale_reset,
                        deleted = report.deleted,
                        "sweep finished"
                    ),
                    Err(e) => error!(error = %e, "sweep failed"),
                }
            }

            info!("sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop after the sweep in progress, if any.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::InMemoryJobStore;
    use chrono::Utc;
    use std::sync::Arc;
    use taskbroker_core::{JobStatus, ManualClock};

    fn setup(config: SweeperConfig) -> (JobQueue<Arc<InMemoryJobStore>>, Sweeper<Arc<InMemoryJobStore>>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let queue = JobQueue::with_clock(InMemoryJobStore::arc(), Arc::new(clock.clone()));
        let sweeper = Sweeper::new(queue.clone(), config);
        (queue, sweeper, clock)
    }

    #[tokio::test]
    async fn run_once_recovers_stale_and_deletes_expired() {
        let (queue, sweeper, clock) = setup(SweeperConfig {
            stale_threshold: Duration::from_secs(60),
            retention: Some(Duration::from_secs(3600)),
            interval: Duration::from_secs(1),
        });

        let done = queue.enqueue("q", "t", serde_json::json!({})).await.unwrap();
        queue.claim_next("q", "w1").await.unwrap().unwrap();
        queue.complete(done.id, serde_json::json!({})).await.unwrap();

        let stuck = queue.enqueue("q", "t", serde_json::json!({})).await.unwrap();
        queue.claim_next("q", "w1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(3601));
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report, SweepReport { stale_reset: 1, deleted: 1 });
        assert!(queue.get(done.id).await.unwrap_err().is_not_found());
        assert_eq!(queue.get(stuck.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn no_retention_keeps_finished_jobs() {
        let (queue, sweeper, clock) = setup(SweeperConfig {
            retention: None,
            ..Default::default()
        });

        let job = queue.enqueue("q", "t", serde_json::json!({})).await.unwrap();
        queue.cancel(job.id).await.unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(queue.get(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_until_shutdown() {
        let (queue, sweeper, clock) = setup(SweeperConfig {
            stale_threshold: Duration::from_secs(60),
            retention: None,
            interval: Duration::from_millis(5),
        });

        let job = queue.enqueue("q", "t", serde_json::json!({})).await.unwrap();
        queue.claim_next("q", "w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(61));

        let handle = sweeper.spawn();
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.get(job.id).await.unwrap().status != JobStatus::Pending {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweeper did not recover the stale job");

        handle.shutdown().await;
    }
}

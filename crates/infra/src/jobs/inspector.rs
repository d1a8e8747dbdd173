//! Read-only queue inspection for operators and dashboards.

use std::sync::Arc;

use tracing::instrument;

use taskbroker_core::{
    Clock, Job, JobFilter, JobPage, MAX_PAGE_SIZE, PageRequest, QueueResult, QueueStats,
    SystemClock,
};

use super::store::JobStore;

/// Listing and statistics over a [`JobStore`]. Never mutates jobs.
#[derive(Clone)]
pub struct QueueInspector<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> QueueInspector<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Filtered, paginated listing, newest-created first.
    #[instrument(skip(self), err)]
    pub async fn list(&self, filter: &JobFilter, page: PageRequest) -> QueueResult<JobPage> {
        let page = page.normalized();
        let (jobs, total) = self.store.list(filter, page.skip(), page.limit()).await?;
        Ok(JobPage::new(jobs, total, page))
    }

    /// Counts for one queue. A queue with no jobs yields all zeros.
    #[instrument(skip(self), err)]
    pub async fn queue_stats(&self, queue_name: &str) -> QueueResult<QueueStats> {
        let now = self.clock.now();
        let stats = self
            .store
            .status_counts(Some(queue_name))
            .await?
            .into_iter()
            .find(|s| s.queue_name == queue_name)
            .unwrap_or_else(|| QueueStats::empty(queue_name));
        Ok(stats.with_age_at(now))
    }

    /// Counts for every queue that has at least one job, ordered by name.
    #[instrument(skip(self), err)]
    pub async fn all_queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let now = self.clock.now();
        let mut stats: Vec<QueueStats> = self
            .store
            .status_counts(None)
            .await?
            .into_iter()
            .map(|s| s.with_age_at(now))
            .collect();
        stats.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        Ok(stats)
    }

    /// Most recently failed jobs across all queues. `limit` is clamped to `1..=200`.
    #[instrument(skip(self), err)]
    pub async fn recent_failed(&self, limit: u32) -> QueueResult<Vec<Job>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.store.recent_failed(u64::from(limit)).await
    }
}

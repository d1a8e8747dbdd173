//! Record store boundary for jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskbroker_core::{Job, JobFilter, JobId, QueueResult, QueueStats};

/// Persistence primitives the queue is built on.
///
/// Every mutation is a single atomic update of one record (or a bulk update
/// of independent records); no method may be emulated with a separate read
/// followed by a write. Keyed mutations return `Ok(None)` when the job does
/// not exist or its status makes the transition inapplicable.
///
/// Implementations never retry internally; store errors are returned as
/// `QueueError::Store`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job.
    async fn insert(&self, job: Job) -> QueueResult<Job>;

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Atomically claim the best eligible pending job in `queue_name`.
    ///
    /// Eligible: `status == pending` and `scheduled_at <= now`. Best: highest
    /// `priority`, then earliest `scheduled_at`. The claimed job is returned
    /// after the update (running, `attempts` incremented).
    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Mark completed regardless of current status.
    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Reschedule at `now + retry_delay` while attempts remain, otherwise fail terminally.
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Pending or running -> cancelled.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Failed or cancelled -> pending, `attempts` preserved.
    async fn retry(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Return running jobs started before `started_before` to pending.
    /// Returns the number of jobs reset.
    async fn reset_stale_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<u64>;

    /// Delete completed and cancelled jobs with `completed_at < cutoff`.
    /// Failed jobs are kept. Returns the number of jobs deleted.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64>;

    /// Matching jobs newest-created first, plus the total match count.
    async fn list(&self, filter: &JobFilter, skip: u64, limit: u64) -> QueueResult<(Vec<Job>, u64)>;

    /// Per-queue status counts and oldest pending `scheduled_at`.
    ///
    /// Restricted to one queue when `queue_name` is set. Ages are left unset.
    async fn status_counts(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>>;

    /// Failed jobs, most recently failed first.
    async fn recent_failed(&self, limit: u64) -> QueueResult<Vec<Job>>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: Job) -> QueueResult<Job> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        (**self).get(id).await
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        (**self).claim_next(queue_name, worker_id, now).await
    }

    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        (**self).complete(id, result, now).await
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        (**self).fail(id, error, retry_delay, now).await
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        (**self).cancel(id, now).await
    }

    async fn retry(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        (**self).retry(id, now).await
    }

    async fn reset_stale_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<u64> {
        (**self).reset_stale_running(started_before, now).await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        (**self).delete_finished_before(cutoff).await
    }

    async fn list(&self, filter: &JobFilter, skip: u64, limit: u64) -> QueueResult<(Vec<Job>, u64)> {
        (**self).list(filter, skip, limit).await
    }

    async fn status_counts(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        (**self).status_counts(queue_name).await
    }

    async fn recent_failed(&self, limit: u64) -> QueueResult<Vec<Job>> {
        (**self).recent_failed(limit).await
    }
}

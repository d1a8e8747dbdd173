//! Job queue engine: enqueue, claim, and lifecycle transitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use taskbroker_core::clock::earlier_by;
use taskbroker_core::{
    Clock, Job, JobId, JobStatus, NewJob, QueueError, QueueResult, SystemClock,
};

use super::store::JobStore;

/// Manages job state over a [`JobStore`]. Executes nothing itself.
///
/// The engine holds no locks: mutual exclusion between workers comes
/// entirely from the store's atomic claim. Clones share the store and clock.
#[derive(Clone)]
pub struct JobQueue<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a pending job from a full enqueue request.
    #[instrument(skip(self, request), fields(queue = %request.queue_name, job_type = %request.job_type), err)]
    pub async fn create(&self, request: NewJob) -> QueueResult<Job> {
        let job = request.into_job(self.now())?;
        let job = self.store.insert(job).await?;
        debug!(
            job_id = %job.id,
            priority = job.priority,
            scheduled_at = %job.scheduled_at,
            "enqueued job"
        );
        Ok(job)
    }

    /// Enqueue for immediate execution with default priority and attempts.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
    ) -> QueueResult<Job> {
        self.create(NewJob::new(queue_name, job_type, payload)).await
    }

    /// Enqueue, claimable once `delay` has passed.
    pub async fn enqueue_delayed(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> QueueResult<Job> {
        self.create(NewJob::new(queue_name, job_type, payload).delayed(delay))
            .await
    }

    /// Enqueue, claimable from `at`.
    pub async fn enqueue_at(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.create(NewJob::new(queue_name, job_type, payload).scheduled_at(at))
            .await
    }

    pub async fn get(&self, id: JobId) -> QueueResult<Job> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Claim the next eligible job in `queue_name` for `worker_id`.
    ///
    /// `Ok(None)` means nothing is eligible right now.
    #[instrument(skip(self), err)]
    pub async fn claim_next(&self, queue_name: &str, worker_id: &str) -> QueueResult<Option<Job>> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::validation("worker_id must not be empty"));
        }

        let claimed = self
            .store
            .claim_next(queue_name, worker_id, self.now())
            .await?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "claimed job");
        }
        Ok(claimed)
    }

    /// Record success. The current status is not re-checked.
    #[instrument(skip(self, result), err)]
    pub async fn complete(&self, id: JobId, result: serde_json::Value) -> QueueResult<Job> {
        let job = self
            .store
            .complete(id, result, self.now())
            .await?
            .ok_or(QueueError::NotFound(id))?;
        debug!(job_id = %job.id, worker_id = ?job.worker_id, "completed job");
        Ok(job)
    }

    /// Record a failed attempt.
    ///
    /// With attempts remaining the job goes back to pending at
    /// `now + retry_delay`; otherwise it becomes `failed`.
    #[instrument(skip(self, error), err)]
    pub async fn fail(&self, id: JobId, error: &str, retry_delay: Duration) -> QueueResult<Job> {
        let job = self
            .store
            .fail(id, error, retry_delay, self.now())
            .await?
            .ok_or(QueueError::NotFound(id))?;

        match job.status {
            JobStatus::Failed => warn!(
                job_id = %job.id,
                attempts = job.attempts,
                error,
                "job failed permanently"
            ),
            _ => debug!(
                job_id = %job.id,
                attempts = job.attempts,
                retry_at = %job.scheduled_at,
                error,
                "job rescheduled after failure"
            ),
        }
        Ok(job)
    }

    /// Cancel a pending or running job.
    ///
    /// A running worker is not interrupted; it sees the new status on its
    /// next read.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let job = self
            .store
            .cancel(id, self.now())
            .await?
            .ok_or(QueueError::NotFound(id))?;
        info!(job_id = %job.id, "cancelled job");
        Ok(job)
    }

    /// Revive a failed or cancelled job. `attempts` is not reset.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, id: JobId) -> QueueResult<Job> {
        let job = self
            .store
            .retry(id, self.now())
            .await?
            .ok_or(QueueError::NotFound(id))?;
        info!(job_id = %job.id, attempts = job.attempts, "retried job");
        Ok(job)
    }

    /// Return jobs running for longer than `stale_threshold` to pending.
    ///
    /// Neither `attempts` nor `max_attempts` is consulted; a job can be
    /// recovered any number of times.
    #[instrument(skip(self), err)]
    pub async fn cleanup_stale_running(&self, stale_threshold: Duration) -> QueueResult<u64> {
        let now = self.now();
        let reset = self
            .store
            .reset_stale_running(earlier_by(now, stale_threshold), now)
            .await?;
        if reset > 0 {
            warn!(reset, ?stale_threshold, "reset stale running jobs to pending");
        }
        Ok(reset)
    }

    /// Permanently delete completed and cancelled jobs finished before `cutoff`.
    #[instrument(skip(self), err)]
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let deleted = self.store.delete_finished_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "deleted finished jobs");
        }
        Ok(deleted)
    }
}

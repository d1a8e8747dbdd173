//! In-memory job store for tests/dev.
//!
//! Each mutation holds the map's write lock for its whole read-modify-write,
//! which gives the same one-winner claim guarantee as the database backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskbroker_core::{Job, JobFilter, JobId, JobStatus, QueueError, QueueResult, QueueStats};

use super::store::JobStore;

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or overwrite a job as-is, bypassing enqueue validation.
    ///
    /// Lets tests seed back-dated or mid-lifecycle records.
    pub fn put(&self, job: Job) -> QueueResult<()> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    pub fn len(&self) -> QueueResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| QueueError::store("in-memory job store lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| QueueError::store("in-memory job store lock poisoned"))
    }

    /// Apply `f` to one job under the write lock. `f` returns whether it changed the job.
    fn update_one(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> bool,
    ) -> QueueResult<Option<Job>> {
        let mut jobs = self.write()?;
        Ok(jobs
            .get_mut(&id)
            .and_then(|job| f(job).then(|| job.clone())))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> QueueResult<Job> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::store(format!("duplicate job id: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let mut jobs = self.write()?;

        // Highest priority, then earliest scheduled_at. created_at and id only
        // make the choice deterministic between otherwise equal jobs.
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(queue_name, now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.mark_running(worker_id, now);
            job.clone()
        }))
    }

    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.update_one(id, |job| {
            job.mark_completed(result, now);
            true
        })
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.update_one(id, |job| {
            job.mark_failed(error, retry_delay, now);
            true
        })
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        self.update_one(id, |job| job.mark_cancelled(now))
    }

    async fn retry(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        self.update_one(id, |job| job.mark_retried(now))
    }

    async fn reset_stale_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let mut jobs = self.write()?;
        let mut reset = 0;
        for job in jobs.values_mut().filter(|j| j.is_stale(started_before)) {
            job.reset_stale(now);
            reset += 1;
        }
        Ok(reset)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| {
            let finished = matches!(j.status, JobStatus::Completed | JobStatus::Cancelled);
            !(finished && j.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn list(&self, filter: &JobFilter, skip: u64, limit: u64) -> QueueResult<(Vec<Job>, u64)> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn status_counts(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        let jobs = self.read()?;
        let mut by_queue: BTreeMap<&str, QueueStats> = BTreeMap::new();

        for job in jobs
            .values()
            .filter(|j| queue_name.is_none_or(|q| j.queue_name == q))
        {
            let stats = by_queue
                .entry(job.queue_name.as_str())
                .or_insert_with(|| QueueStats::empty(&job.queue_name));
            stats.add(job.status, 1);
            if job.status == JobStatus::Pending {
                stats.observe_pending(job.scheduled_at);
            }
        }

        Ok(by_queue.into_values().collect())
    }

    async fn recent_failed(&self, limit: u64) -> QueueResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut failed: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .collect();
        failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id)));

        Ok(failed
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

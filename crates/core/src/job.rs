//! The job entity and its state transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::later_by;
use crate::error::{QueueError, QueueResult};
use crate::id::JobId;

/// Attempts allowed when the enqueuer does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a worker
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown job status: {s}")))
    }
}

/// When a new job becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    #[default]
    Immediate,
    /// After a delay, measured from enqueue time.
    After(Duration),
    /// At a fixed instant.
    At(DateTime<Utc>),
}

impl Schedule {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Immediate => now,
            Schedule::After(delay) => later_by(now, delay),
            Schedule::At(at) => at,
        }
    }
}

/// An enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue_name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub schedule: Schedule,
}

impl NewJob {
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: Schedule::Immediate,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.schedule = Schedule::After(delay);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Schedule::At(at);
        self
    }

    /// Validate and materialize the request as a pending job.
    pub fn into_job(self, now: DateTime<Utc>) -> QueueResult<Job> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::validation("queue_name must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(QueueError::validation("job_type must not be empty"));
        }

        Ok(Job {
            id: JobId::new(),
            queue_name: self.queue_name,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            error: None,
            result: None,
            scheduled_at: self.schedule.resolve(now),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            worker_id: None,
        })
    }
}

/// A queued unit of work.
///
/// Payload and result are opaque to the queue; only the worker's handler for
/// `job_type` interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher claims first within a queue.
    pub priority: i32,
    /// Incremented on every claim, never decremented.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Last failure message.
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Earliest eligible claim time.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn is_claimable(&self, queue_name: &str, now: DateTime<Utc>) -> bool {
        self.queue_name == queue_name && self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Running since before `started_before`.
    pub fn is_stale(&self, started_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.started_at.is_some_and(|at| at < started_before)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Claim: pending -> running.
    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.to_string());
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Reschedule after `retry_delay` if attempts remain, otherwise fail terminally.
    pub fn mark_failed(&mut self, error: &str, retry_delay: Duration, now: DateTime<Utc>) {
        self.error = Some(error.to_string());
        self.updated_at = now;

        if self.has_attempts_remaining() {
            self.status = JobStatus::Pending;
            self.scheduled_at = later_by(now, retry_delay);
            self.started_at = None;
            self.worker_id = None;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
    }

    /// Returns `false` (and leaves the job untouched) unless pending or running.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_cancellable() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Returns `false` (and leaves the job untouched) unless failed or cancelled.
    ///
    /// `attempts` is preserved, so a manually retried job may run past
    /// `max_attempts`.
    pub fn mark_retried(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_retryable() {
            return false;
        }
        self.status = JobStatus::Pending;
        self.scheduled_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.worker_id = None;
        self.error = None;
        self.updated_at = now;
        true
    }

    /// Crash recovery: running -> pending without touching `attempts`.
    pub fn reset_stale(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.worker_id = None;
        self.error = Some(STALE_RESET_MESSAGE.to_string());
        self.updated_at = now;
    }
}

/// Error recorded on a job returned to pending by the stale-running sweep.
pub const STALE_RESET_MESSAGE: &str = "reset to pending: worker did not report within the stale threshold";

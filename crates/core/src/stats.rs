//! Per-queue statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Snapshot of one queue. Eventually consistent with in-flight claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// `scheduled_at` of the longest-waiting pending job.
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Age of that job when the snapshot was taken (backlog lag).
    pub oldest_pending_age: Option<Duration>,
}

impl QueueStats {
    pub fn empty(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Fold in a pending job's `scheduled_at`, keeping the earliest.
    pub fn observe_pending(&mut self, scheduled_at: DateTime<Utc>) {
        self.oldest_pending_at = Some(match self.oldest_pending_at {
            Some(current) => current.min(scheduled_at),
            None => scheduled_at,
        });
    }

    /// Fill `oldest_pending_age` relative to `now`. Future-scheduled jobs have age zero.
    pub fn with_age_at(mut self, now: DateTime<Utc>) -> Self {
        self.oldest_pending_age = self
            .oldest_pending_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_total() {
        let mut stats = QueueStats::empty("email");
        stats.add(JobStatus::Pending, 2);
        stats.add(JobStatus::Running, 1);
        stats.add(JobStatus::Failed, 4);

        assert_eq!(stats.count(JobStatus::Pending), 2);
        assert_eq!(stats.count(JobStatus::Completed), 0);
        assert_eq!(stats.total(), 7);
    }

    #[test]
    fn oldest_pending_age_is_measured_from_now() {
        let now = Utc::now();
        let mut stats = QueueStats::empty("email");
        stats.observe_pending(now - chrono::Duration::minutes(5));
        stats.observe_pending(now - chrono::Duration::minutes(12));
        stats.observe_pending(now + chrono::Duration::minutes(1));

        let stats = stats.with_age_at(now);
        assert_eq!(stats.oldest_pending_age, Some(Duration::from_secs(12 * 60)));
    }

    #[test]
    fn no_pending_means_no_age() {
        let stats = QueueStats::empty("email").with_age_at(Utc::now());
        assert!(stats.oldest_pending_age.is_none());
    }
}

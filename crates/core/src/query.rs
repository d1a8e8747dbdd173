//! Listing filters and pagination for queue inspection.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Default page size for job listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Page size cap; keeps listing responses bounded.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Filter criteria for job listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub queue_name: Option<String>,
    pub job_type: Option<String>,
    /// Match any of these statuses. Empty means any status.
    pub statuses: Vec<JobStatus>,
}

impl JobFilter {
    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses = vec![status];
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue_name.as_deref().is_none_or(|q| job.queue_name == q)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
    }
}

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Page numbers below 1 become 1; page size is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Re-apply clamping (for requests built with struct literal syntax).
    pub fn normalized(self) -> Self {
        Self::new(self.page, self.page_size)
    }

    pub fn skip(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

/// One page of a job listing, newest-created first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matching jobs across all pages.
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl JobPage {
    pub fn new(jobs: Vec<Job>, total: u64, request: PageRequest) -> Self {
        let total_pages = total.div_ceil(u64::from(request.page_size));
        Self {
            jobs,
            total,
            page: request.page,
            page_size: request.page_size,
            total_pages: u32::try_from(total_pages).unwrap_or(u32::MAX),
        }
    }

    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

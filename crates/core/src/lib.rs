//! `taskbroker-core`: job queue domain building blocks.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! the `Job` entity and its transitions, enqueue requests, listing filters,
//! queue statistics, retry policies, and the error taxonomy.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod query;
pub mod retry;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::JobId;
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, NewJob, STALE_RESET_MESSAGE, Schedule};
pub use query::{JobFilter, JobPage, MAX_PAGE_SIZE, PageRequest};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use stats::QueueStats;

//! Background job queue over a shared record store.
//!
//! ## Design
//!
//! - Producers enqueue; any number of workers claim concurrently
//! - A claim is one atomic find-and-update in the store, so each pending job
//!   goes to exactly one worker
//! - Failed attempts are rescheduled until `max_attempts` is reached
//! - Crashed workers are recovered by the stale-running sweep
//!
//! ## Components
//!
//! - `JobStore`: persistence primitives (in-memory or MongoDB)
//! - `JobQueue`: enqueue, claim, and lifecycle transitions
//! - `QueueInspector`: listing and per-queue statistics
//! - `JobExecutor`: reference worker loop with handler dispatch
//! - `Sweeper`: periodic stale recovery and retention cleanup

pub mod executor;
pub mod inspector;
pub mod memory;
pub mod mongo;
pub mod queue;
pub mod store;
pub mod sweeper;

pub use executor::{ExecutorStats, HandlerOutcome, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use inspector::QueueInspector;
pub use memory::InMemoryJobStore;
pub use mongo::MongoJobStore;
pub use queue::JobQueue;
pub use store::JobStore;
pub use sweeper::{SweepReport, Sweeper, SweeperConfig, SweeperHandle};

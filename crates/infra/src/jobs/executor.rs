//! Reference worker: claims jobs from one queue and runs registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskbroker_core::{Job, JobStatus, QueueResult, RetryPolicy};

use super::queue::JobQueue;
use super::store::JobStore;

/// What a handler reports back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Done; the value is stored as the job's result.
    Success(serde_json::Value),
    /// Failed; retried after the executor's policy delay while attempts remain.
    Failure(String),
    /// Failed; retried after exactly `delay` while attempts remain.
    RetryAfter { error: String, delay: Duration },
}

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Recorded on claimed jobs
    pub worker_id: String,
    /// Queue to claim from
    pub queue_name: String,
    /// How long to wait when the queue is empty
    pub poll_interval: Duration,
    /// Delay passed to `fail` for `HandlerOutcome::Failure`
    pub retry_policy: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            worker_id: "job-executor".to_string(),
            queue_name: "default".to_string(),
            poll_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts, including ones that were rescheduled.
    pub jobs_failed: u64,
    /// Failures that left the job terminally `failed`.
    pub jobs_exhausted: u64,
    pub claim_errors: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default)]
struct SharedStats(Arc<Mutex<ExecutorStats>>);

impl SharedStats {
    fn update(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut stats = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }

    fn snapshot(&self) -> ExecutorStats {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: SharedStats,
}

impl JobExecutorHandle {
    /// Stop claiming and wait for the in-flight job, if any, to be recorded.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job executor task panicked");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }
}

/// Background job executor.
///
/// Polls one queue, runs the handler registered for each claimed job's
/// `job_type`, and reports the outcome through `complete` or `fail`.
pub struct JobExecutor<S: JobStore> {
    queue: JobQueue<S>,
    handlers: HashMap<String, JobHandler>,
    retry_policy: RetryPolicy,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Register a handler for a job type.
    ///
    /// `pattern` is an exact type, a `prefix.*` category, or `*`.
    pub fn register_handler<F, Fut>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let handler: JobHandler =
            Arc::new(move |job: Job| -> BoxFuture<'static, HandlerOutcome> { Box::pin(handler(job)) });
        self.handlers.insert(pattern.into(), handler);
    }

    /// Exact match first, then the longest matching `prefix.*`, then `*`.
    fn get_handler(&self, job_type: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler)
            .or_else(|| self.handlers.get("*"))
    }

    /// Run the handler for an already-claimed job and record the outcome.
    ///
    /// The handler runs on its own task; a panic is recorded as a failed attempt.
    pub async fn execute_one(&self, job: Job) -> QueueResult<Job> {
        let id = job.id;
        let attempt = job.attempts;

        let outcome = match self.get_handler(&job.job_type) {
            Some(handler) => match tokio::spawn(handler(job)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_id = %id, error = %e, "job handler panicked");
                    HandlerOutcome::Failure(format!("handler panicked: {e}"))
                }
            },
            None => {
                warn!(job_id = %id, job_type = %job.job_type, "no handler for job");
                HandlerOutcome::Failure(format!("no handler for job type: {}", job.job_type))
            }
        };

        match outcome {
            HandlerOutcome::Success(result) => self.queue.complete(id, result).await,
            HandlerOutcome::Failure(error) => {
                let delay = self.retry_policy.delay_for_attempt(attempt);
                self.queue.fail(id, &error, delay).await
            }
            HandlerOutcome::RetryAfter { error, delay } => {
                self.queue.fail(id, &error, delay).await
            }
        }
    }

    /// Spawn the poll loop on the current tokio runtime.
    pub fn spawn(mut self, config: JobExecutorConfig) -> JobExecutorHandle {
        self.retry_policy = config.retry_policy;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let join = tokio::spawn(executor_loop(self, config, shutdown_rx, stats.clone()));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: SharedStats,
) {
    info!(executor = %config.name, queue = %config.queue_name, "job executor started");
    let start_time = Instant::now();

    while !*shutdown_rx.borrow() {
        stats.update(|s| s.uptime_secs = start_time.elapsed().as_secs());

        match executor
            .queue
            .claim_next(&config.queue_name, &config.worker_id)
            .await
        {
            Ok(Some(job)) => {
                let job_id = job.id;
                let result = executor.execute_one(job).await;

                stats.update(|s| {
                    s.jobs_processed += 1;
                    match &result {
                        Ok(job) if job.status == JobStatus::Completed => s.jobs_succeeded += 1,
                        Ok(job) => {
                            s.jobs_failed += 1;
                            if job.status == JobStatus::Failed {
                                s.jobs_exhausted += 1;
                            }
                        }
                        Err(_) => s.jobs_failed += 1,
                    }
                });

                match result {
                    Ok(job) => debug!(
                        executor = %config.name,
                        job_id = %job_id,
                        status = %job.status,
                        "job attempt recorded"
                    ),
                    Err(e) => error!(
                        executor = %config.name,
                        job_id = %job_id,
                        error = %e,
                        "failed to record job outcome"
                    ),
                }
            }
            Ok(None) => idle(&mut shutdown_rx, config.poll_interval).await,
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                stats.update(|s| s.claim_errors += 1);
                idle(&mut shutdown_rx, config.poll_interval).await;
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}

/// Sleep for `interval`, waking early on shutdown.
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::InMemoryJobStore;
    use taskbroker_core::NewJob;

    type Store = Arc<InMemoryJobStore>;

    fn queue() -> JobQueue<Store> {
        JobQueue::new(InMemoryJobStore::arc())
    }

    async fn enqueue_and_claim(queue: &JobQueue<Store>, job_type: &str, max_attempts: u32) -> Job {
        queue
            .create(NewJob::new("q", job_type, serde_json::json!({})).with_max_attempts(max_attempts))
            .await
            .unwrap();
        queue.claim_next("q", "w1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let queue = queue();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |job: Job| async move {
            HandlerOutcome::Success(serde_json::json!({ "echo": job.job_type }))
        });

        let claimed = enqueue_and_claim(&queue, "test", 3).await;
        let done = executor.execute_one(claimed).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({ "echo": "test" })));
    }

    #[tokio::test]
    async fn failing_job_is_rescheduled_then_exhausted() {
        let queue = queue();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |_job: Job| async {
            HandlerOutcome::RetryAfter {
                error: "test error".to_string(),
                delay: Duration::ZERO,
            }
        });

        let claimed = enqueue_and_claim(&queue, "test", 2).await;
        let first = executor.execute_one(claimed).await.unwrap();
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.error.as_deref(), Some("test error"));

        let claimed = queue.claim_next("q", "w1").await.unwrap().unwrap();
        let second = executor.execute_one(claimed).await.unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn failure_uses_policy_delay() {
        let queue = queue();
        let mut executor = JobExecutor::new(queue.clone());
        executor.retry_policy = RetryPolicy::fixed(Duration::from_secs(45));
        executor.register_handler("test", |_job: Job| async {
            HandlerOutcome::Failure("nope".to_string())
        });

        let claimed = enqueue_and_claim(&queue, "test", 3).await;
        let before = queue.now();
        let failed = executor.execute_one(claimed).await.unwrap();

        assert_eq!(failed.status, JobStatus::Pending);
        assert!(failed.scheduled_at >= before + chrono::Duration::seconds(45));
    }

    #[tokio::test]
    async fn unknown_job_type_fails_with_no_handler() {
        let queue = queue();
        let executor = JobExecutor::new(queue.clone());

        let claimed = enqueue_and_claim(&queue, "mystery", 1).await;
        let failed = executor.execute_one(claimed).await.unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("no handler"));
    }

    fn broken_handler(_job: Job) -> HandlerOutcome {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_as_failure() {
        let queue = queue();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |job: Job| async move { broken_handler(job) });

        let claimed = enqueue_and_claim(&queue, "test", 1).await;
        let failed = executor.execute_one(claimed).await.unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("handler panicked"));
    }

    #[tokio::test]
    async fn spawned_executor_survives_a_panicking_handler() {
        let queue = queue();
        queue
            .create(NewJob::new("q", "explode", serde_json::json!({})).with_max_attempts(1))
            .await
            .unwrap();
        queue.enqueue("q", "test", serde_json::json!({})).await.unwrap();

        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("explode", |job: Job| async move { broken_handler(job) });
        executor.register_handler("test", |_job: Job| async {
            HandlerOutcome::Success(serde_json::Value::Null)
        });
        let handle = executor.spawn(
            JobExecutorConfig::for_queue("q").with_poll_interval(Duration::from_millis(5)),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().jobs_processed < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor stopped after a handler panic");

        let stats = handle.stats();
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_exhausted, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn handler_lookup_prefers_exact_then_longest_category() {
        let mut executor = JobExecutor::new(queue());
        executor.register_handler("*", |_job: Job| async {
            HandlerOutcome::Success(serde_json::json!("wildcard"))
        });
        executor.register_handler("email.*", |_job: Job| async {
            HandlerOutcome::Success(serde_json::json!("email"))
        });
        executor.register_handler("email.digest.*", |_job: Job| async {
            HandlerOutcome::Success(serde_json::json!("digest"))
        });
        executor.register_handler("email.welcome", |_job: Job| async {
            HandlerOutcome::Success(serde_json::json!("welcome"))
        });

        let resolve = |job_type: &str| {
            let job = NewJob::new("q", job_type, serde_json::json!({}))
                .into_job(chrono::Utc::now())
                .unwrap();
            let handler = executor.get_handler(job_type).unwrap().clone();
            async move { handler(job).await }
        };

        assert_eq!(
            resolve("email.welcome").await,
            HandlerOutcome::Success(serde_json::json!("welcome"))
        );
        assert_eq!(
            resolve("email.digest.weekly").await,
            HandlerOutcome::Success(serde_json::json!("digest"))
        );
        assert_eq!(
            resolve("email.bounce").await,
            HandlerOutcome::Success(serde_json::json!("email"))
        );
        assert_eq!(
            resolve("emails").await,
            HandlerOutcome::Success(serde_json::json!("wildcard"))
        );
    }

    #[tokio::test]
    async fn spawned_executor_drains_queue_and_shuts_down() {
        let queue = queue();
        for i in 0..5 {
            queue
                .enqueue("q", "test", serde_json::json!({ "i": i }))
                .await
                .unwrap();
        }

        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |_job: Job| async {
            HandlerOutcome::Success(serde_json::Value::Null)
        });
        let handle = executor.spawn(
            JobExecutorConfig::for_queue("q").with_poll_interval(Duration::from_millis(5)),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().jobs_succeeded < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor did not drain the queue");

        let stats = handle.stats();
        assert_eq!(stats.jobs_processed, 5);
        assert_eq!(stats.jobs_failed, 0);
        handle.shutdown().await;

        assert!(queue.claim_next("q", "w1").await.unwrap().is_none());
    }
}

//! MongoDB-backed job store.
//!
//! Every transition is one server-side atomic operation on one document:
//!
//! | Operation | Driver call |
//! |-----------|-------------|
//! | claim | `find_one_and_update`, sorted `{priority: -1, scheduled_at: 1}`, returning the new document |
//! | complete / cancel / retry | `find_one_and_update` filtered by id (and allowed statuses) |
//! | fail | `find_one_and_update` with an aggregation-pipeline update that branches on `attempts < max_attempts` |
//! | stale recovery | `update_many` |
//! | retention | `delete_many` |
//! | stats | `aggregate` with `$group` on `(queue_name, status)` |
//!
//! ## Error Mapping
//!
//! Driver errors become `QueueError::Store` tagged with the operation name.
//! Rows that cannot be converted back to a `Job` become `QueueError::Serialization`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use taskbroker_core::clock::later_by;
use taskbroker_core::{
    Job, JobFilter, JobId, JobStatus, QueueError, QueueResult, QueueStats, STALE_RESET_MESSAGE,
};

use super::store::JobStore;

/// Job store over one MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoJobStore {
    jobs: Collection<JobDocument>,
}

impl MongoJobStore {
    pub fn new(jobs: Collection<JobDocument>) -> Self {
        Self { jobs }
    }

    /// Connect with a MongoDB connection string and open `database.collection`.
    #[instrument(skip(uri), err)]
    pub async fn connect(uri: &str, database: &str, collection: &str) -> QueueResult<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| map_mongo_error("connect", e))?;
        options.app_name.get_or_insert_with(|| "taskbroker".to_string());

        let client = Client::with_options(options).map_err(|e| map_mongo_error("connect", e))?;
        let jobs = client.database(database).collection::<JobDocument>(collection);
        info!(database, collection, "connected job store");
        Ok(Self::new(jobs))
    }

    pub fn collection(&self) -> &Collection<JobDocument> {
        &self.jobs
    }

    /// Create the indexes the queue's queries rely on. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_indexes(&self) -> QueueResult<()> {
        let index = |name: &str, keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().name(name.to_string()).build())
                .build()
        };

        let indexes = vec![
            index(
                "claim",
                doc! { "queue_name": 1, "status": 1, "priority": -1, "scheduled_at": 1 },
            ),
            index("stale", doc! { "status": 1, "started_at": 1 }),
            index("retention", doc! { "status": 1, "completed_at": -1 }),
            index("listing", doc! { "created_at": -1 }),
        ];

        self.jobs
            .create_indexes(indexes, None)
            .await
            .map_err(|e| map_mongo_error("ensure_indexes", e))?;
        Ok(())
    }

    async fn find_one_and_set(
        &self,
        operation: &'static str,
        filter: Document,
        update: Document,
    ) -> QueueResult<Option<Job>> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        self.jobs
            .find_one_and_update(filter, update, options)
            .await
            .map_err(|e| map_mongo_error(operation, e))?
            .map(Job::try_from)
            .transpose()
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_name), err)]
    async fn insert(&self, job: Job) -> QueueResult<Job> {
        let row = JobDocument::try_from(&job)?;
        self.jobs
            .insert_one(row, None)
            .await
            .map_err(|e| map_mongo_error("insert", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.jobs
            .find_one(doc! { "_id": id.to_string() }, None)
            .await
            .map_err(|e| map_mongo_error("get", e))?
            .map(Job::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(queue = %queue_name, worker_id = %worker_id), err)]
    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let now = bson::DateTime::from_chrono(now);
        let filter = doc! {
            "queue_name": queue_name,
            "status": JobStatus::Pending.as_str(),
            "scheduled_at": { "$lte": now },
        };
        let update = doc! {
            "$set": {
                "status": JobStatus::Running.as_str(),
                "started_at": now,
                "worker_id": worker_id,
                "updated_at": now,
            },
            "$inc": { "attempts": 1 },
        };
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "priority": -1, "scheduled_at": 1, "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .jobs
            .find_one_and_update(filter, update, options)
            .await
            .map_err(|e| map_mongo_error("claim_next", e))?
            .map(Job::try_from)
            .transpose()?;

        if let Some(job) = &claimed {
            debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, result), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let now = bson::DateTime::from_chrono(now);
        let result = json_to_bson(&result)?;
        self.find_one_and_set(
            "complete",
            doc! { "_id": id.to_string() },
            doc! {
                "$set": {
                    "status": JobStatus::Completed.as_str(),
                    "result": result,
                    "completed_at": now,
                    "updated_at": now,
                }
            },
        )
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_delay: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let retry_at = bson::DateTime::from_chrono(later_by(now, retry_delay));
        let now = bson::DateTime::from_chrono(now);

        let pipeline = fail_pipeline(error, retry_at, now);

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        self.jobs
            .find_one_and_update(doc! { "_id": id.to_string() }, pipeline, options)
            .await
            .map_err(|e| map_mongo_error("fail", e))?
            .map(Job::try_from)
            .transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let now = bson::DateTime::from_chrono(now);
        self.find_one_and_set(
            "cancel",
            doc! {
                "_id": id.to_string(),
                "status": { "$in": [JobStatus::Pending.as_str(), JobStatus::Running.as_str()] },
            },
            doc! {
                "$set": {
                    "status": JobStatus::Cancelled.as_str(),
                    "completed_at": now,
                    "updated_at": now,
                }
            },
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry(&self, id: JobId, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let now = bson::DateTime::from_chrono(now);
        self.find_one_and_set(
            "retry",
            doc! {
                "_id": id.to_string(),
                "status": { "$in": [JobStatus::Failed.as_str(), JobStatus::Cancelled.as_str()] },
            },
            doc! {
                "$set": {
                    "status": JobStatus::Pending.as_str(),
                    "scheduled_at": now,
                    "started_at": Bson::Null,
                    "completed_at": Bson::Null,
                    "worker_id": Bson::Null,
                    "error": Bson::Null,
                    "updated_at": now,
                }
            },
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn reset_stale_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let now = bson::DateTime::from_chrono(now);
        let result = self
            .jobs
            .update_many(
                doc! {
                    "status": JobStatus::Running.as_str(),
                    "started_at": { "$lt": bson::DateTime::from_chrono(started_before) },
                },
                doc! {
                    "$set": {
                        "status": JobStatus::Pending.as_str(),
                        "started_at": Bson::Null,
                        "worker_id": Bson::Null,
                        "error": STALE_RESET_MESSAGE,
                        "updated_at": now,
                    }
                },
                None,
            )
            .await
            .map_err(|e| map_mongo_error("reset_stale_running", e))?;
        Ok(result.modified_count)
    }

    #[instrument(skip(self), err)]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let result = self
            .jobs
            .delete_many(
                doc! {
                    "status": { "$in": [JobStatus::Completed.as_str(), JobStatus::Cancelled.as_str()] },
                    "completed_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
                },
                None,
            )
            .await
            .map_err(|e| map_mongo_error("delete_finished_before", e))?;
        Ok(result.deleted_count)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter, skip: u64, limit: u64) -> QueueResult<(Vec<Job>, u64)> {
        let filter = filter_document(filter);

        let total = self
            .jobs
            .count_documents(filter.clone(), None)
            .await
            .map_err(|e| map_mongo_error("count_jobs", e))?;

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1, "_id": -1 })
            .skip(skip)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();
        let rows: Vec<JobDocument> = self
            .jobs
            .find(filter, options)
            .await
            .map_err(|e| map_mongo_error("list_jobs", e))?
            .try_collect()
            .await
            .map_err(|e| map_mongo_error("list_jobs", e))?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<QueueResult<Vec<_>>>()?;
        Ok((jobs, total))
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        let mut pipeline = Vec::new();
        if let Some(queue_name) = queue_name {
            pipeline.push(doc! { "$match": { "queue_name": queue_name } });
        }
        pipeline.push(doc! {
            "$group": {
                "_id": { "queue": "$queue_name", "status": "$status" },
                "count": { "$sum": 1 },
                "oldest_pending_at": {
                    "$min": {
                        "$cond": [
                            { "$eq": ["$status", JobStatus::Pending.as_str()] },
                            "$scheduled_at",
                            Bson::Null,
                        ]
                    }
                },
            }
        });

        let groups: Vec<Document> = self
            .jobs
            .aggregate(pipeline, None)
            .await
            .map_err(|e| map_mongo_error("status_counts", e))?
            .try_collect()
            .await
            .map_err(|e| map_mongo_error("status_counts", e))?;

        let mut by_queue: BTreeMap<String, QueueStats> = BTreeMap::new();
        for group in groups {
            let (queue, status, count, oldest) = parse_status_group(&group)?;
            let stats = by_queue
                .entry(queue.clone())
                .or_insert_with(|| QueueStats::empty(queue));
            stats.add(status, count);
            if let Some(at) = oldest {
                stats.observe_pending(at);
            }
        }

        Ok(by_queue.into_values().collect())
    }

    #[instrument(skip(self), err)]
    async fn recent_failed(&self, limit: u64) -> QueueResult<Vec<Job>> {
        let options = FindOptions::builder()
            .sort(doc! { "completed_at": -1, "_id": -1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();
        let rows: Vec<JobDocument> = self
            .jobs
            .find(doc! { "status": JobStatus::Failed.as_str() }, options)
            .await
            .map_err(|e| map_mongo_error("recent_failed", e))?
            .try_collect()
            .await
            .map_err(|e| map_mongo_error("recent_failed", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

/// Stored form of a job.
///
/// Timestamps use BSON dates (millisecond precision) so range filters and
/// sorts run on the server; the id is the UUID string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Bson,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub result: Option<Bson>,
    pub scheduled_at: bson::DateTime,
    pub started_at: Option<bson::DateTime>,
    pub completed_at: Option<bson::DateTime>,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
    pub worker_id: Option<String>,
}

impl TryFrom<&Job> for JobDocument {
    type Error = QueueError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: job.id.to_string(),
            queue_name: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            payload: json_to_bson(&job.payload)?,
            status: job.status,
            priority: job.priority,
            attempts: i64::from(job.attempts),
            max_attempts: i64::from(job.max_attempts),
            error: job.error.clone(),
            result: job.result.as_ref().map(json_to_bson).transpose()?,
            scheduled_at: bson::DateTime::from_chrono(job.scheduled_at),
            started_at: job.started_at.map(bson::DateTime::from_chrono),
            completed_at: job.completed_at.map(bson::DateTime::from_chrono),
            created_at: bson::DateTime::from_chrono(job.created_at),
            updated_at: bson::DateTime::from_chrono(job.updated_at),
            worker_id: job.worker_id.clone(),
        })
    }
}

impl TryFrom<JobDocument> for Job {
    type Error = QueueError;

    fn try_from(row: JobDocument) -> Result<Self, Self::Error> {
        let count = |field: &str, value: i64| {
            u32::try_from(value)
                .map_err(|_| QueueError::serialization(format!("{field} out of range: {value}")))
        };

        Ok(Job {
            id: row.id.parse()?,
            queue_name: row.queue_name,
            job_type: row.job_type,
            payload: row.payload.into_relaxed_extjson(),
            status: row.status,
            priority: row.priority,
            attempts: count("attempts", row.attempts)?,
            max_attempts: count("max_attempts", row.max_attempts)?,
            error: row.error,
            result: row.result.map(Bson::into_relaxed_extjson),
            scheduled_at: row.scheduled_at.to_chrono(),
            started_at: row.started_at.map(bson::DateTime::to_chrono),
            completed_at: row.completed_at.map(bson::DateTime::to_chrono),
            created_at: row.created_at.to_chrono(),
            updated_at: row.updated_at.to_chrono(),
            worker_id: row.worker_id,
        })
    }
}

fn json_to_bson(value: &serde_json::Value) -> QueueResult<Bson> {
    bson::to_bson(value).map_err(|e| QueueError::serialization(e.to_string()))
}

/// Update pipeline for `fail`. The attempts check and the write happen in one
/// server-side update.
///
/// Pipeline stages evaluate `$`-prefixed strings as field paths, so the
/// caller's message goes through `$literal`.
fn fail_pipeline(error: &str, retry_at: bson::DateTime, now: bson::DateTime) -> Vec<Document> {
    let retryable = doc! { "$lt": ["$attempts", "$max_attempts"] };
    vec![doc! {
        "$set": {
            "error": { "$literal": error },
            "updated_at": now,
            "status": {
                "$cond": [retryable.clone(), JobStatus::Pending.as_str(), JobStatus::Failed.as_str()]
            },
            "scheduled_at": { "$cond": [retryable.clone(), retry_at, "$scheduled_at"] },
            "started_at": { "$cond": [retryable.clone(), Bson::Null, "$started_at"] },
            "worker_id": { "$cond": [retryable.clone(), Bson::Null, "$worker_id"] },
            "completed_at": { "$cond": [retryable, "$completed_at", now] },
        }
    }]
}

fn filter_document(filter: &JobFilter) -> Document {
    let mut document = Document::new();
    if let Some(queue_name) = &filter.queue_name {
        document.insert("queue_name", queue_name.as_str());
    }
    if let Some(job_type) = &filter.job_type {
        document.insert("job_type", job_type.as_str());
    }
    match filter.statuses.as_slice() {
        [] => {}
        [status] => {
            document.insert("status", status.as_str());
        }
        statuses => {
            let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
            document.insert("status", doc! { "$in": statuses });
        }
    }
    document
}

fn parse_status_group(
    group: &Document,
) -> QueueResult<(String, JobStatus, u64, Option<DateTime<Utc>>)> {
    let malformed = |e: bson::document::ValueAccessError| {
        QueueError::serialization(format!("malformed status group: {e}"))
    };

    let key = group.get_document("_id").map_err(malformed)?;
    let queue = key.get_str("queue").map_err(malformed)?.to_string();
    let status = key.get_str("status").map_err(malformed)?.parse::<JobStatus>()?;
    let count = match group.get("count") {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        other => {
            return Err(QueueError::serialization(format!(
                "malformed status group count: {other:?}"
            )));
        }
    };
    let oldest = match group.get("oldest_pending_at") {
        Some(Bson::DateTime(at)) => Some(at.to_chrono()),
        _ => None,
    };

    Ok((queue, status, count, oldest))
}

fn map_mongo_error(operation: &str, e: mongodb::error::Error) -> QueueError {
    QueueError::store(format!("{operation}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskbroker_core::NewJob;

    #[test]
    fn document_conversion_preserves_job_fields() {
        let now = bson::DateTime::now().to_chrono();
        let mut job = NewJob::new("export", "report", serde_json::json!({"rows": 10, "fmt": "csv"}))
            .with_priority(7)
            .into_job(now)
            .unwrap();
        job.mark_running("w1", now);
        job.mark_completed(serde_json::json!({"url": "s3://bucket/report.csv"}), now);

        let row = JobDocument::try_from(&job).unwrap();
        assert_eq!(row.id, job.id.to_string());
        assert_eq!(row.status, JobStatus::Completed);

        let back = Job::try_from(row).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn negative_attempts_are_rejected() {
        let job = NewJob::new("q", "t", serde_json::json!({}))
            .into_job(Utc::now())
            .unwrap();
        let mut row = JobDocument::try_from(&job).unwrap();
        row.attempts = -1;

        let err = Job::try_from(row).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn fail_pipeline_stores_message_as_literal() {
        let now = bson::DateTime::now();
        let pipeline = fail_pipeline("$HOME not set", now, now);

        assert_eq!(pipeline.len(), 1);
        let set = pipeline[0].get_document("$set").unwrap();
        assert_eq!(
            set.get_document("error").unwrap(),
            &doc! { "$literal": "$HOME not set" }
        );
        assert_eq!(set.get_datetime("updated_at").unwrap(), &now);
    }

    #[test]
    fn filter_document_uses_in_for_status_sets() {
        let single = filter_document(&JobFilter::default().queue("email").status(JobStatus::Failed));
        assert_eq!(single, doc! { "queue_name": "email", "status": "failed" });

        let many = filter_document(
            &JobFilter::default()
                .job_type("digest")
                .statuses([JobStatus::Pending, JobStatus::Running]),
        );
        assert_eq!(
            many,
            doc! { "job_type": "digest", "status": { "$in": ["pending", "running"] } }
        );
    }

    #[test]
    fn status_groups_parse_both_integer_widths() {
        let at = bson::DateTime::now();
        let group = doc! {
            "_id": { "queue": "email", "status": "pending" },
            "count": 3_i64,
            "oldest_pending_at": at,
        };
        let (queue, status, count, oldest) = parse_status_group(&group).unwrap();
        assert_eq!(queue, "email");
        assert_eq!(status, JobStatus::Pending);
        assert_eq!(count, 3);
        assert_eq!(oldest, Some(at.to_chrono()));

        let group = doc! {
            "_id": { "queue": "email", "status": "running" },
            "count": 1_i32,
            "oldest_pending_at": Bson::Null,
        };
        let (_, _, count, oldest) = parse_status_group(&group).unwrap();
        assert_eq!(count, 1);
        assert!(oldest.is_none());
    }
}

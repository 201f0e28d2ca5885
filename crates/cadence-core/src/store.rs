//! Persistence contract for schedule jobs and their execution history.

use crate::error::Result;
use crate::types::{ScheduleActionRecord, ScheduleJob};

/// Durable CRUD for job definitions and action records.
///
/// Calls are synchronous and must preserve read-your-writes per key.
/// Implementations report a duplicate job name as `AlreadyExists`, an
/// unknown key as `NotFound` and any other backend failure as `Database`.
pub trait ScheduleStore: Send + Sync {
    fn add_job(&self, job: &ScheduleJob) -> Result<ScheduleJob>;

    /// Replace the stored job with the same id. When the name changes, the
    /// job's action records move to the new name in the same write.
    fn update_job(&self, job: &ScheduleJob) -> Result<()>;

    fn delete_job_by_name(&self, name: &str) -> Result<()>;

    fn job_by_name(&self, name: &str) -> Result<ScheduleJob>;

    fn job_by_id(&self, id: &str) -> Result<ScheduleJob>;

    /// Jobs ordered by creation time. An empty `labels` slice matches every
    /// job; otherwise a job matches when it carries any of the labels.
    /// A negative `limit` means no limit.
    fn all_jobs(&self, labels: &[String], offset: i64, limit: i64) -> Result<Vec<ScheduleJob>>;

    fn job_count(&self, labels: &[String]) -> Result<u32>;

    fn add_records(&self, records: &[ScheduleActionRecord]) -> Result<()>;

    /// For each action of the job, the record with the greatest `scheduled_at`.
    fn latest_records_by_job_name(&self, name: &str) -> Result<Vec<ScheduleActionRecord>>;

    /// Newest first.
    fn records_by_job_name(
        &self,
        name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScheduleActionRecord>>;

    /// Delete every record whose `scheduled_at` is strictly before
    /// `timestamp` (epoch ms). Returns the number of deleted records.
    fn delete_records_older_than(&self, timestamp: i64) -> Result<u64>;
}

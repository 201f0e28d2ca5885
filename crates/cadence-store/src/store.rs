use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use tracing::{debug, instrument};

use cadence_core::{
    AdminState, CadenceError, Result, ScheduleActionRecord, ScheduleJob, ScheduleStore,
};

const JOB_COLUMNS: &str = "id, name, admin_state, definition, actions, labels, created, modified";
const RECORD_COLUMNS: &str =
    "id, job_name, action_id, action, scheduled_at, status, correlation_id, created";

/// SQLite-backed [`ScheduleStore`].
///
/// Wraps a single connection in a `Mutex`; every call holds the lock only
/// for the duration of its statements.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| CadenceError::Database("connection lock poisoned".into()))
    }
}

impl ScheduleStore for SqliteStore {
    #[instrument(skip(self, job), fields(job = %job.name))]
    fn add_job(&self, job: &ScheduleJob) -> Result<ScheduleJob> {
        let definition = serde_json::to_string(&job.definition)?;
        let actions = serde_json::to_string(&job.actions)?;
        let labels = serde_json::to_string(&job.labels)?;

        let db = self.conn()?;
        db.execute(
            "INSERT INTO schedule_jobs
             (id, name, admin_state, definition, actions, labels, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id,
                job.name,
                job.admin_state.to_string(),
                definition,
                actions,
                labels,
                job.created,
                job.modified
            ],
        )
        .map_err(|e| map_write_error(e, &job.name))?;
        debug!("scheduled job inserted");
        Ok(job.clone())
    }

    #[instrument(skip(self, job), fields(job = %job.name))]
    fn update_job(&self, job: &ScheduleJob) -> Result<()> {
        let definition = serde_json::to_string(&job.definition)?;
        let actions = serde_json::to_string(&job.actions)?;
        let labels = serde_json::to_string(&job.labels)?;

        let mut db = self.conn()?;
        let tx = db
            .transaction()
            .map_err(db_error("begin job update transaction"))?;
        let previous_name: String = match tx.query_row(
            "SELECT name FROM schedule_jobs WHERE id = ?1",
            params![job.id],
            |row| row.get(0),
        ) {
            Ok(name) => name,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(CadenceError::NotFound(format!(
                    "scheduled job with id '{}'",
                    job.id
                )))
            }
            Err(e) => return Err(db_error("look up scheduled job")(e)),
        };

        tx.execute(
            "UPDATE schedule_jobs
             SET name = ?1, admin_state = ?2, definition = ?3, actions = ?4,
                 labels = ?5, modified = ?6
             WHERE id = ?7",
            params![
                job.name,
                job.admin_state.to_string(),
                definition,
                actions,
                labels,
                job.modified,
                job.id
            ],
        )
        .map_err(|e| map_write_error(e, &job.name))?;

        if previous_name != job.name {
            let moved = tx
                .execute(
                    "UPDATE schedule_action_records SET job_name = ?1 WHERE job_name = ?2",
                    params![job.name, previous_name],
                )
                .map_err(db_error("move schedule action records"))?;
            debug!(from = %previous_name, records = moved, "history moved to renamed job");
        }
        tx.commit().map_err(db_error("commit job update"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete_job_by_name(&self, name: &str) -> Result<()> {
        let db = self.conn()?;
        let rows_changed = db
            .execute("DELETE FROM schedule_jobs WHERE name = ?1", params![name])
            .map_err(db_error("delete scheduled job"))?;
        if rows_changed == 0 {
            return Err(CadenceError::NotFound(format!("scheduled job '{name}'")));
        }
        Ok(())
    }

    fn job_by_name(&self, name: &str) -> Result<ScheduleJob> {
        let db = self.conn()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE name = ?1");
        match db.query_row(&sql, params![name], row_to_job) {
            Ok(job) => Ok(job),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(CadenceError::NotFound(format!("scheduled job '{name}'")))
            }
            Err(e) => Err(db_error("query scheduled job by name")(e)),
        }
    }

    fn job_by_id(&self, id: &str) -> Result<ScheduleJob> {
        let db = self.conn()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE id = ?1");
        match db.query_row(&sql, params![id], row_to_job) {
            Ok(job) => Ok(job),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(CadenceError::NotFound(format!(
                "scheduled job with id '{id}'"
            ))),
            Err(e) => Err(db_error("query scheduled job by id")(e)),
        }
    }

    fn all_jobs(&self, labels: &[String], offset: i64, limit: i64) -> Result<Vec<ScheduleJob>> {
        let (filter, mut values) = label_filter(labels);
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM schedule_jobs {filter}
             ORDER BY created, rowid
             LIMIT ? OFFSET ?"
        );
        values.push(Value::Integer(limit));
        values.push(Value::Integer(offset.max(0)));

        let db = self.conn()?;
        let mut stmt = db.prepare(&sql).map_err(db_error("query scheduled jobs"))?;
        let jobs = stmt
            .query_map(params_from_iter(values.iter()), row_to_job)
            .map_err(db_error("query scheduled jobs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("decode scheduled jobs"))?;
        Ok(jobs)
    }

    fn job_count(&self, labels: &[String]) -> Result<u32> {
        let (filter, values) = label_filter(labels);
        let sql = format!("SELECT COUNT(*) FROM schedule_jobs {filter}");
        let db = self.conn()?;
        let count: i64 = db
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .map_err(db_error("count scheduled jobs"))?;
        Ok(count as u32)
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    fn add_records(&self, records: &[ScheduleActionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut db = self.conn()?;
        let tx = db
            .transaction()
            .map_err(db_error("begin record transaction"))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO schedule_action_records
                     (id, job_name, action_id, action, scheduled_at, status, correlation_id, created)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(db_error("prepare record insert"))?;
            for record in records {
                let action = serde_json::to_string(&record.action)?;
                stmt.execute(params![
                    record.id,
                    record.job_name,
                    record.action_id,
                    action,
                    record.scheduled_at,
                    record.status.to_string(),
                    record.correlation_id,
                    record.created
                ])
                .map_err(db_error("insert schedule action record"))?;
            }
        }
        tx.commit().map_err(db_error("commit records"))?;
        Ok(())
    }

    fn latest_records_by_job_name(&self, name: &str) -> Result<Vec<ScheduleActionRecord>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY action_id ORDER BY scheduled_at DESC, created DESC
                ) AS rn
                FROM schedule_action_records
                WHERE job_name = ?1
             )
             WHERE rn = 1
             ORDER BY scheduled_at DESC"
        );
        let mut stmt = db
            .prepare(&sql)
            .map_err(db_error("query latest records"))?;
        let records = stmt
            .query_map(params![name], row_to_record)
            .map_err(db_error("query latest records"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("decode latest records"))?;
        Ok(records)
    }

    fn records_by_job_name(
        &self,
        name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScheduleActionRecord>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM schedule_action_records
             WHERE job_name = ?1
             ORDER BY scheduled_at DESC, created DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = db.prepare(&sql).map_err(db_error("query records"))?;
        let records = stmt
            .query_map(params![name, limit, offset.max(0)], row_to_record)
            .map_err(db_error("query records"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error("decode records"))?;
        Ok(records)
    }

    #[instrument(skip(self))]
    fn delete_records_older_than(&self, timestamp: i64) -> Result<u64> {
        let db = self.conn()?;
        let n = db
            .execute(
                "DELETE FROM schedule_action_records WHERE scheduled_at < ?1",
                params![timestamp],
            )
            .map_err(db_error("purge schedule action records"))?;
        Ok(n as u64)
    }
}

/// `WHERE` clause matching jobs that carry any of `labels`, plus its bind values.
fn label_filter(labels: &[String]) -> (String, Vec<Value>) {
    if labels.is_empty() {
        return (String::new(), Vec::new());
    }
    let placeholders = vec!["?"; labels.len()].join(", ");
    let clause = format!(
        "WHERE EXISTS (SELECT 1 FROM json_each(schedule_jobs.labels) WHERE json_each.value IN ({placeholders}))"
    );
    let values = labels.iter().cloned().map(Value::Text).collect();
    (clause, values)
}

fn db_error(op: &'static str) -> impl FnOnce(rusqlite::Error) -> CadenceError {
    move |e| CadenceError::Database(format!("failed to {op}: {e}"))
}

fn map_write_error(e: rusqlite::Error, name: &str) -> CadenceError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            CadenceError::AlreadyExists(format!("scheduled job '{name}'"))
        }
        _ => CadenceError::Database(format!("failed to write scheduled job '{name}': {e}")),
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a SQLite row to a `ScheduleJob`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleJob> {
    let admin_state: String = row.get(2)?;
    let admin_state: AdminState = admin_state.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(ScheduleJob {
        id: row.get(0)?,
        name: row.get(1)?,
        admin_state,
        definition: json_column(row, 3)?,
        actions: json_column(row, 4)?,
        labels: json_column(row, 5)?,
        created: row.get(6)?,
        modified: row.get(7)?,
    })
}

/// Map a SQLite row to a `ScheduleActionRecord`.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleActionRecord> {
    let status: String = row.get(5)?;
    let status = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(ScheduleActionRecord {
        id: row.get(0)?,
        job_name: row.get(1)?,
        action_id: row.get(2)?,
        action: json_column(row, 3)?,
        scheduled_at: row.get(4)?,
        status,
        correlation_id: row.get(6)?,
        created: row.get(7)?,
    })
}

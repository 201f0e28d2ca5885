use rusqlite::Connection;

use cadence_core::{CadenceError, Result};

/// Initialise the schedule job and action record tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schedule_jobs (
            id           TEXT    NOT NULL PRIMARY KEY,
            name         TEXT    NOT NULL UNIQUE,
            admin_state  TEXT    NOT NULL,
            definition   TEXT    NOT NULL,   -- JSON-encoded ScheduleDefinition
            actions      TEXT    NOT NULL,   -- JSON array of ScheduleAction
            labels       TEXT    NOT NULL DEFAULT '[]',
            created      INTEGER NOT NULL,   -- epoch ms
            modified     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedule_action_records (
            id             TEXT    NOT NULL PRIMARY KEY,
            job_name       TEXT    NOT NULL,
            action_id      TEXT    NOT NULL,
            action         TEXT    NOT NULL,  -- JSON snapshot of the action
            scheduled_at   INTEGER NOT NULL,  -- epoch ms
            status         TEXT    NOT NULL,
            correlation_id TEXT    NOT NULL,
            created        INTEGER NOT NULL
        );

        -- latest-record lookup per action during reconciliation
        CREATE INDEX IF NOT EXISTS idx_records_job_action
            ON schedule_action_records (job_name, action_id, scheduled_at DESC);

        -- retention purge: DELETE … WHERE scheduled_at < ?
        CREATE INDEX IF NOT EXISTS idx_records_scheduled_at
            ON schedule_action_records (scheduled_at);",
    )
    .map_err(|e| CadenceError::Database(format!("failed to initialise schema: {e}")))?;
    Ok(())
}

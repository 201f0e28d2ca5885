//! Startup reconciliation: synthesise `Missed` records for every instant a
//! job should have fired while the service was not running.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cadence_core::{
    CorrelationId, RecordStatus, Result, ScheduleActionRecord, ScheduleJob, ScheduleStore,
};

use crate::recurrence::{instant_from_millis, Recurrence};

/// Missed records are written in chunks of this many.
pub const RECONCILE_BATCH_SIZE: usize = 1_000;

/// Missed records for `job` given the latest stored record of each action.
///
/// For every action the lower bound is its own latest `scheduled_at`
/// (falling back to the newest record of the job, for actions added after
/// the last firing), raised to the job's start timestamp. Instants equal
/// to the lower bound are already recorded and the instant equal to `now`
/// belongs to the live path, so both ends are exclusive. An action with
/// neither history nor a start timestamp has nothing to anchor on and is
/// skipped.
pub fn missed_records(
    job: &ScheduleJob,
    latest: &[ScheduleActionRecord],
    now: DateTime<Utc>,
    correlation_id: &CorrelationId,
) -> Result<Vec<ScheduleActionRecord>> {
    Ok(missed_firings(job, latest, now, correlation_id)?.collect())
}

/// Lazy form of [`missed_records`], one action after another.
fn missed_firings<'a>(
    job: &'a ScheduleJob,
    latest: &'a [ScheduleActionRecord],
    now: DateTime<Utc>,
    correlation_id: &'a CorrelationId,
) -> Result<impl Iterator<Item = ScheduleActionRecord> + 'a> {
    let recurrence = Recurrence::compile(&job.definition.def)?;
    let locked = job.is_locked();
    let job_latest = latest.iter().map(|r| r.scheduled_at).max();
    let start = Some(job.definition.start_timestamp).filter(|ms| *ms > 0);

    let bounds = job.actions.iter().filter(move |_| !locked).filter_map(move |action| {
        let last_fired = latest
            .iter()
            .filter(|r| r.action_id == action.id)
            .map(|r| r.scheduled_at)
            .max()
            .or(job_latest);
        let last_known = match (last_fired, start) {
            (Some(fired), Some(start)) => fired.max(start),
            (Some(ms), None) | (None, Some(ms)) => ms,
            (None, None) => return None,
        };
        Some((action, instant_from_millis(last_known)))
    });

    Ok(bounds.flat_map(move |(action, last_known)| {
        recurrence
            .firings(&job.definition, last_known, now)
            .filter(move |t| *t > last_known && *t < now)
            .map(move |t| {
                ScheduleActionRecord::new(
                    &job.name,
                    action,
                    t,
                    RecordStatus::Missed,
                    correlation_id,
                )
            })
    }))
}

/// Load the job's latest records, compute what was missed and store it in
/// batches of [`RECONCILE_BATCH_SIZE`]. Returns the number of records
/// written.
///
/// Batches already written stay written when a later one fails; a rerun
/// picks up after the newest stored record of each action.
pub fn reconcile(
    store: &dyn ScheduleStore,
    job: &ScheduleJob,
    now: DateTime<Utc>,
    correlation_id: &CorrelationId,
) -> Result<usize> {
    if job.is_locked() {
        debug!(
            job = %job.name,
            correlation_id = %correlation_id,
            "job is locked, skipping missed records"
        );
        return Ok(0);
    }

    let latest = store.latest_records_by_job_name(&job.name).map_err(|e| {
        e.with_context(format!("loading latest records of job '{}'", job.name))
    })?;

    let mut written = 0;
    let mut batch = Vec::with_capacity(RECONCILE_BATCH_SIZE);
    let mut missed = missed_firings(job, &latest, now, correlation_id)?.peekable();
    while let Some(record) = missed.next() {
        batch.push(record);
        if batch.len() < RECONCILE_BATCH_SIZE && missed.peek().is_some() {
            continue;
        }
        store.add_records(&batch).map_err(|e| {
            e.with_context(format!("storing missed records of job '{}'", job.name))
        })?;
        written += batch.len();
        batch.clear();
    }

    if written == 0 {
        debug!(job = %job.name, correlation_id = %correlation_id, "no missed firings");
        return Ok(0);
    }
    warn!(
        job = %job.name,
        count = written,
        correlation_id = %correlation_id,
        "missed firings recorded"
    );
    info!(job = %job.name, correlation_id = %correlation_id, "reconciliation complete");
    Ok(written)
}

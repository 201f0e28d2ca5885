//! Live firing: walks the expected instants of a running job and invokes
//! its actions, writing one record per action per instant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use cadence_core::{
    CorrelationId, RecordStatus, ScheduleActionRecord, ScheduleJob, ScheduleStore,
};

use crate::executor::ActionExecutor;
use crate::recurrence::ExpectedFirings;

/// An instant we reach later than this is recorded as missed instead of fired.
pub const LATE_FIRING_TOLERANCE_MS: i64 = 5_000;

/// Drive `firings` until the window is exhausted or the task is aborted.
pub(crate) async fn run_schedule(
    job: Arc<ScheduleJob>,
    firings: ExpectedFirings,
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn ActionExecutor>,
) {
    for instant in firings {
        let wait = (instant - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let correlation_id = CorrelationId::new();
        let lateness = (Utc::now() - instant).num_milliseconds();
        if lateness > LATE_FIRING_TOLERANCE_MS {
            warn!(
                job = %job.name,
                %instant,
                lateness_ms = lateness,
                correlation_id = %correlation_id,
                "firing instant overrun, recording as missed"
            );
            let records: Vec<_> = job
                .actions
                .iter()
                .map(|action| {
                    ScheduleActionRecord::new(
                        &job.name,
                        action,
                        instant,
                        RecordStatus::Missed,
                        &correlation_id,
                    )
                })
                .collect();
            persist(store.as_ref(), &job.name, &records);
            continue;
        }

        fire_once(&job, instant, store.as_ref(), executor.as_ref(), &correlation_id).await;
    }
    debug!(job = %job.name, "schedule window exhausted");
}

/// Invoke every action of `job` once, in order, and record the outcomes
/// against `scheduled_at`. Failures are recorded, never propagated.
pub(crate) async fn fire_once(
    job: &ScheduleJob,
    scheduled_at: DateTime<Utc>,
    store: &dyn ScheduleStore,
    executor: &dyn ActionExecutor,
    correlation_id: &CorrelationId,
) -> Vec<ScheduleActionRecord> {
    let mut records = Vec::with_capacity(job.actions.len());
    for action in &job.actions {
        let status = match executor.execute(job, action, correlation_id).await {
            Ok(()) => RecordStatus::Succeeded,
            Err(e) => {
                warn!(
                    job = %job.name,
                    action = %action.id,
                    error = %e,
                    correlation_id = %correlation_id,
                    "action failed"
                );
                RecordStatus::Failed
            }
        };
        records.push(ScheduleActionRecord::new(
            &job.name,
            action,
            scheduled_at,
            status,
            correlation_id,
        ));
    }
    persist(store, &job.name, &records);
    debug!(
        job = %job.name,
        %scheduled_at,
        actions = records.len(),
        correlation_id = %correlation_id,
        "job fired"
    );
    records
}

fn persist(store: &dyn ScheduleStore, job_name: &str, records: &[ScheduleActionRecord]) {
    if let Err(e) = store.add_records(records) {
        error!(job = %job_name, error = %e, "failed to store schedule action records");
    }
}

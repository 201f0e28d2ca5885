//! Retention: periodic deletion of old schedule action records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cadence_core::{CadenceError, Result, ScheduleStore};

/// Delete every record scheduled before `now - max_age`.
pub fn purge_once(store: &dyn ScheduleStore, now: DateTime<Utc>, max_age: Duration) -> Result<u64> {
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|_| {
            CadenceError::Config(format!("retention max age {max_age:?} is out of range"))
        })?;
    let horizon = now - max_age;
    let deleted = store
        .delete_records_older_than(horizon.timestamp_millis())
        .map_err(|e| e.with_context("purging schedule action records"))?;
    debug!(deleted, %horizon, "retention purge tick");
    Ok(deleted)
}

/// Spawn the purge loop. The first tick happens one `interval` after the
/// call; cancellation is only observed between ticks.
pub fn spawn_purger(
    store: Arc<dyn ScheduleStore>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_age_secs = max_age.as_secs(),
            "retention purger started"
        );
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match purge_once(store.as_ref(), Utc::now(), max_age) {
                        Ok(0) => {}
                        Ok(n) => info!(deleted = n, "purged expired schedule action records"),
                        Err(e) => error!(error = %e, "retention purge failed, retrying next tick"),
                    }
                }
            }
        }
        info!("retention purger stopped");
    })
}

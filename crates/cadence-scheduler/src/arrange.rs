use std::time::Duration;

use chrono::{DateTime, Utc};

use cadence_core::ScheduleJob;

/// What the registry should arm for a job, computed from its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrangement {
    /// Admin state is locked; nothing is armed.
    Locked,
    /// The end timestamp already passed; the job is never started.
    Expired,
    /// Start after `start_after`; stop after `stop_after` when the window is bounded.
    Armed {
        start_after: Duration,
        stop_after: Option<Duration>,
    },
}

impl Arrangement {
    pub fn is_armed(&self) -> bool {
        matches!(self, Arrangement::Armed { .. })
    }
}

/// Turn a job's start/end timestamps into a pair of one-shot delays.
///
/// A start timestamp in the past (or unset) means "start now".
pub fn arrange(now: DateTime<Utc>, job: &ScheduleJob) -> Arrangement {
    if job.is_locked() {
        return Arrangement::Locked;
    }

    let now_ms = now.timestamp_millis();
    let start = job.definition.start_timestamp;
    let end = job.definition.end_timestamp;

    if end != 0 && end < now_ms {
        return Arrangement::Expired;
    }

    let start_after = Duration::from_millis(start.saturating_sub(now_ms).max(0) as u64);
    let stop_after =
        (end != 0 && end > now_ms).then(|| Duration::from_millis((end - now_ms) as u64));

    Arrangement::Armed {
        start_after,
        stop_after,
    }
}

//! Expected firing instants of a recurrence rule.
//!
//! The evaluator is a pure, restartable function of
//! `(definition, from, to)`: it never consults the clock, and two calls with
//! the same arguments yield the same sequence. Everything is evaluated in
//! UTC.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule as CronSchedule;

use cadence_core::config::parse_duration;
use cadence_core::{CadenceError, Result, ScheduleDef, ScheduleDefinition};

/// Compiled form of a [`ScheduleDef`].
#[derive(Debug, Clone)]
pub enum Recurrence {
    Interval(Duration),
    Cron(Box<CronSchedule>),
}

impl Recurrence {
    /// Parse the rule. Unparseable rules are `ContractInvalid`.
    pub fn compile(def: &ScheduleDef) -> Result<Self> {
        match def {
            ScheduleDef::Interval { interval } => {
                let std = parse_duration(interval)
                    .map_err(|e| CadenceError::ContractInvalid(format!("invalid interval: {e}")))?;
                let interval = Duration::from_std(std).map_err(|_| {
                    CadenceError::ContractInvalid(format!("interval '{interval}' is too large"))
                })?;
                Ok(Recurrence::Interval(interval))
            }
            ScheduleDef::Cron { crontab } => parse_crontab(crontab).map(Recurrence::Cron),
        }
    }

    /// Lazily enumerate the instants in `[from, to]`, further clipped to the
    /// definition's own start/end window.
    pub fn firings(
        &self,
        definition: &ScheduleDefinition,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ExpectedFirings {
        let to = match definition.end_at() {
            Some(end) if end < to => end,
            _ => to,
        };
        let lower = match definition.start_at() {
            Some(start) if start > from => start,
            _ => from,
        };

        let first = match self {
            Recurrence::Interval(interval) => first_interval_instant(from, lower, *interval),
            Recurrence::Cron(schedule) => first_cron_instant(schedule, lower),
        };

        ExpectedFirings {
            recurrence: self.clone(),
            next: first.filter(|t| *t <= to),
            to,
        }
    }
}

/// Convenience wrapper: compile `definition` and enumerate `[from, to]`.
pub fn expected_firings(
    definition: &ScheduleDefinition,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<ExpectedFirings> {
    Ok(Recurrence::compile(&definition.def)?.firings(definition, from, to))
}

/// Ordered, finite iterator over expected firing instants.
#[derive(Debug, Clone)]
pub struct ExpectedFirings {
    recurrence: Recurrence,
    next: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
}

impl Iterator for ExpectedFirings {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let following = match &self.recurrence {
            Recurrence::Interval(interval) => current.checked_add_signed(*interval),
            Recurrence::Cron(schedule) => schedule.after(&current).next(),
        };
        self.next = following.filter(|t| *t <= self.to);
        Some(current)
    }
}

/// Smallest `anchor + k·interval` (k ≥ 0) that is not before `lower`.
fn first_interval_instant(
    anchor: DateTime<Utc>,
    lower: DateTime<Utc>,
    interval: Duration,
) -> Option<DateTime<Utc>> {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return None;
    }
    let gap = (lower - anchor).num_milliseconds();
    if gap <= 0 {
        return Some(anchor);
    }
    let k = (gap + step - 1) / step;
    anchor.checked_add_signed(Duration::milliseconds(k.checked_mul(step)?))
}

/// First cron occurrence at or after `lower`.
fn first_cron_instant(schedule: &CronSchedule, lower: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // `after` is exclusive and works on whole seconds.
    let just_before = lower - Duration::milliseconds(1);
    schedule.after(&just_before).find(|t| *t >= lower)
}

/// Accepts 5-field (seconds implied `0`), 6- and 7-field expressions and
/// the usual `@` shortcuts.
fn parse_crontab(crontab: &str) -> Result<Box<CronSchedule>> {
    let trimmed = crontab.trim();
    let expression = match trimmed.to_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@weekly" => "0 0 0 * * SUN".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        s if s.starts_with('@') => {
            return Err(CadenceError::ContractInvalid(format!(
                "unknown cron shortcut: {trimmed}"
            )))
        }
        _ => match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(CadenceError::ContractInvalid(format!(
                    "crontab '{trimmed}' has {n} fields, expected 5, 6 or 7"
                )))
            }
        },
    };

    CronSchedule::from_str(&expression)
        .map(Box::new)
        .map_err(|e| CadenceError::ContractInvalid(format!("invalid crontab '{trimmed}': {e}")))
}

/// Epoch milliseconds to a UTC instant, clamping out-of-range values.
pub(crate) fn instant_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

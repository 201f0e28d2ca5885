//! `cadence-scheduler`: the scheduler manager and everything that drives it.
//!
//! # Overview
//!
//! [`manager::SchedulerManager`] is the concurrent registry of live
//! schedules. [`arrange::arrange`] turns a job's start/end window into the
//! start/stop timers the manager installs, and [`recurrence`] computes the
//! instants a running job fires at. On startup [`application::ScheduleApp`]
//! reloads every stored job, writes `Missed` records for the instants that
//! passed while the service was down ([`reconcile`]) and starts the
//! retention loop ([`purge`]).
//!
//! # Recurrence rules
//!
//! | Rule       | Instants                                               |
//! |------------|--------------------------------------------------------|
//! | `Interval` | `from + k·interval`, clipped to the job window         |
//! | `Cron`     | 5/6/7-field expression or `@daily`-style shortcut, UTC |

pub mod application;
pub mod arrange;
pub mod executor;
pub mod manager;
pub mod purge;
pub mod reconcile;
pub mod recurrence;
mod runner;

#[cfg(test)]
mod test_support;

pub use application::{LoadReport, ScheduleApp};
pub use arrange::{arrange, Arrangement};
pub use executor::{ActionExecutor, HttpActionExecutor};
pub use manager::{EntryState, SchedulerManager};
pub use recurrence::{expected_firings, ExpectedFirings, Recurrence};

//! The schedule registry: a concurrent map from job name to its live entry.
//!
//! Each entry owns up to three background tasks: the one-shot start and
//! stop timers installed by [`SchedulerManager::arm`], and the runner that
//! fires the job while it is `Running`. Map guards are only ever held for
//! the lookup and the handle swap; actions always run on spawned tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cadence_core::{CadenceError, CorrelationId, Result, ScheduleJob, ScheduleStore};

use crate::arrange::Arrangement;
use crate::executor::ActionExecutor;
use crate::recurrence::Recurrence;
use crate::runner::{fire_once, run_schedule};

/// Lifecycle of a registry entry: `Registered → Running ⇄ Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Added or updated, waiting for its start timer.
    Registered,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Start,
    Stop,
}

/// A spawned one-shot timer. Cancelling aborts the sleeping task.
struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    fn cancel(self) {
        self.0.abort();
    }
}

struct ScheduleEntry {
    job: Arc<ScheduleJob>,
    recurrence: Recurrence,
    state: EntryState,
    /// Timers carry the generation they were armed for; a timer whose
    /// generation no longer matches is stale and does nothing.
    generation: u64,
    start_timer: Option<TimerHandle>,
    stop_timer: Option<TimerHandle>,
    runner: Option<JoinHandle<()>>,
}

impl ScheduleEntry {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.start_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.stop_timer.take() {
            timer.cancel();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_timers();
        if let Some(runner) = self.runner.take() {
            runner.abort();
        }
    }
}

struct ManagerInner {
    entries: DashMap<String, ScheduleEntry>,
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn ActionExecutor>,
    generations: AtomicU64,
}

impl ManagerInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Spawn the runner unless the entry is already running.
    fn start_entry(&self, handle: &Handle, name: &str, entry: &mut ScheduleEntry) {
        if entry.state == EntryState::Running {
            debug!(job = %name, "already running");
            return;
        }
        // the start timer sleeps on the monotonic clock; never anchor before
        // the start instant even if the wall clock lags behind it
        let anchor = match entry.job.definition.start_at() {
            Some(start) => start.max(Utc::now()),
            None => Utc::now(),
        };
        let firings = entry
            .recurrence
            .firings(&entry.job.definition, anchor, DateTime::<Utc>::MAX_UTC);
        entry.runner = Some(handle.spawn(run_schedule(
            Arc::clone(&entry.job),
            firings,
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
        )));
        entry.state = EntryState::Running;
        info!(job = %name, "schedule started");
    }

    fn stop_entry(&self, name: &str, entry: &mut ScheduleEntry) {
        if entry.state == EntryState::Stopped {
            debug!(job = %name, "already stopped");
            return;
        }
        if let Some(runner) = entry.runner.take() {
            runner.abort();
        }
        entry.state = EntryState::Stopped;
        info!(job = %name, "schedule stopped");
    }

    /// Timer callback. Does nothing if the entry is gone or was re-armed
    /// after this timer was installed.
    fn fire_timer(
        &self,
        name: &str,
        generation: u64,
        kind: TimerKind,
        correlation_id: &CorrelationId,
    ) {
        let Some(mut entry) = self.entries.get_mut(name) else {
            debug!(job = %name, ?kind, "timer fired for removed job");
            return;
        };
        if entry.generation != generation {
            debug!(job = %name, ?kind, "stale timer ignored");
            return;
        }
        match kind {
            TimerKind::Start => {
                // the slot holds this very task; drop it without aborting
                entry.start_timer = None;
                match Handle::try_current() {
                    Ok(handle) => self.start_entry(&handle, name, &mut entry),
                    Err(e) => warn!(
                        job = %name,
                        error = %e,
                        correlation_id = %correlation_id,
                        "start timer outside runtime"
                    ),
                }
            }
            TimerKind::Stop => {
                entry.stop_timer = None;
                self.stop_entry(name, &mut entry);
            }
        }
    }
}

/// Concurrent registry of live schedules. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SchedulerManager {
    inner: Arc<ManagerInner>,
}

impl SchedulerManager {
    pub fn new(store: Arc<dyn ScheduleStore>, executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                entries: DashMap::new(),
                store,
                executor,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Register `job` in state `Registered` with no timers armed.
    pub fn add(&self, job: ScheduleJob, correlation_id: &CorrelationId) -> Result<()> {
        let recurrence = Recurrence::compile(&job.definition.def)?;
        let generation = self.inner.next_generation();
        match self.inner.entries.entry(job.name.clone()) {
            Entry::Occupied(_) => Err(CadenceError::AlreadyExists(format!(
                "scheduled job '{}' is already registered",
                job.name
            ))),
            Entry::Vacant(slot) => {
                info!(job = %job.name, correlation_id = %correlation_id, "schedule registered");
                slot.insert(ScheduleEntry {
                    job: Arc::new(job),
                    recurrence,
                    state: EntryState::Registered,
                    generation,
                    start_timer: None,
                    stop_timer: None,
                    runner: None,
                });
                Ok(())
            }
        }
    }

    /// Replace definition and actions of a registered job, cancelling its
    /// timers and runner. The entry is `Registered` until re-armed.
    pub fn update(&self, job: ScheduleJob, correlation_id: &CorrelationId) -> Result<()> {
        let recurrence = Recurrence::compile(&job.definition.def)?;
        let generation = self.inner.next_generation();
        let mut entry = self
            .inner
            .entries
            .get_mut(&job.name)
            .ok_or_else(|| not_found(&job.name))?;
        entry.cancel_all();
        entry.recurrence = recurrence;
        entry.state = EntryState::Registered;
        entry.generation = generation;
        info!(job = %job.name, correlation_id = %correlation_id, "schedule updated");
        entry.job = Arc::new(job);
        Ok(())
    }

    /// Cancel everything the entry owns and remove it.
    pub fn delete(&self, name: &str, correlation_id: &CorrelationId) -> Result<()> {
        let (_, mut entry) = self.inner.entries.remove(name).ok_or_else(|| not_found(name))?;
        entry.cancel_all();
        info!(job = %name, correlation_id = %correlation_id, "schedule removed");
        Ok(())
    }

    /// Install the start/stop timers computed by [`crate::arrange`],
    /// replacing any previously armed ones.
    pub fn arm(
        &self,
        name: &str,
        arrangement: Arrangement,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        let (start_after, stop_after) = match arrangement {
            Arrangement::Locked => {
                info!(
                    job = %name,
                    correlation_id = %correlation_id,
                    "job is locked, not arranging"
                );
                return Ok(());
            }
            Arrangement::Expired => {
                info!(
                    job = %name,
                    correlation_id = %correlation_id,
                    "job window already ended, not starting"
                );
                return Ok(());
            }
            Arrangement::Armed {
                start_after,
                stop_after,
            } => (start_after, stop_after),
        };

        let handle = runtime()?;
        let generation = self.inner.next_generation();
        let mut entry = self.inner.entries.get_mut(name).ok_or_else(|| not_found(name))?;
        entry.cancel_timers();
        entry.generation = generation;
        entry.start_timer = Some(self.spawn_timer(
            &handle,
            name,
            generation,
            TimerKind::Start,
            start_after,
            correlation_id,
        ));
        entry.stop_timer = stop_after.map(|delay| {
            self.spawn_timer(&handle, name, generation, TimerKind::Stop, delay, correlation_id)
        });
        info!(
            job = %name,
            start_after_ms = start_after.as_millis() as u64,
            stop_after_ms = stop_after.map(|d| d.as_millis() as u64),
            correlation_id = %correlation_id,
            "job arranged"
        );
        Ok(())
    }

    /// `Registered | Stopped → Running`; a no-op when already running.
    pub fn start_by_name(&self, name: &str, correlation_id: &CorrelationId) -> Result<()> {
        let handle = runtime()?;
        let mut entry = self.inner.entries.get_mut(name).ok_or_else(|| not_found(name))?;
        debug!(job = %name, correlation_id = %correlation_id, "start requested");
        self.inner.start_entry(&handle, name, &mut entry);
        Ok(())
    }

    /// `Running → Stopped`; a no-op when already stopped.
    pub fn stop_by_name(&self, name: &str, correlation_id: &CorrelationId) -> Result<()> {
        let mut entry = self.inner.entries.get_mut(name).ok_or_else(|| not_found(name))?;
        debug!(job = %name, correlation_id = %correlation_id, "stop requested");
        self.inner.stop_entry(name, &mut entry);
        Ok(())
    }

    /// Fire the job's actions once, now, on a spawned task. Armed timers
    /// and the entry state are left alone.
    pub fn trigger_by_name(
        &self,
        name: &str,
        correlation_id: &CorrelationId,
    ) -> Result<JoinHandle<()>> {
        let handle = runtime()?;
        let job = self
            .inner
            .entries
            .get(name)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or_else(|| not_found(name))?;
        let store = Arc::clone(&self.inner.store);
        let executor = Arc::clone(&self.inner.executor);
        let correlation_id = correlation_id.clone();
        info!(job = %name, correlation_id = %correlation_id, "job triggered");
        Ok(handle.spawn(async move {
            let now = Utc::now();
            fire_once(&job, now, store.as_ref(), executor.as_ref(), &correlation_id).await;
        }))
    }

    pub fn state(&self, name: &str) -> Option<EntryState> {
        self.inner.entries.get(name).map(|entry| entry.state)
    }

    pub fn job(&self, name: &str) -> Option<Arc<ScheduleJob>> {
        self.inner.entries.get(name).map(|entry| Arc::clone(&entry.job))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Abort every timer and runner. Entries stay registered.
    pub fn shutdown(&self) {
        for mut entry in self.inner.entries.iter_mut() {
            entry.cancel_all();
            if entry.state == EntryState::Running {
                entry.state = EntryState::Stopped;
            }
        }
        info!(jobs = self.inner.entries.len(), "scheduler manager shut down");
    }

    fn spawn_timer(
        &self,
        handle: &Handle,
        name: &str,
        generation: u64,
        kind: TimerKind,
        delay: Duration,
        correlation_id: &CorrelationId,
    ) -> TimerHandle {
        let inner: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        let correlation_id = correlation_id.clone();
        TimerHandle(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire_timer(&name, generation, kind, &correlation_id);
            }
        }))
    }
}

fn not_found(name: &str) -> CadenceError {
    CadenceError::NotFound(format!("scheduled job '{name}' is not registered"))
}

fn runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| CadenceError::Server(format!("no async runtime to arm timers on: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{interval_job, CountingExecutor, MemoryStore};
    use cadence_core::{ErrorKind, RecordStatus};

    fn manager() -> (SchedulerManager, Arc<MemoryStore>, Arc<CountingExecutor>) {
        let store = Arc::new(MemoryStore::default());
        let executor = Arc::new(CountingExecutor::default());
        let manager = SchedulerManager::new(store.clone(), executor.clone());
        (manager, store, executor)
    }

    fn armed(start_ms: u64, stop_ms: Option<u64>) -> Arrangement {
        Arrangement::Armed {
            start_after: Duration::from_millis(start_ms),
            stop_after: stop_ms.map(Duration::from_millis),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn registry_errors_are_typed() {
        let (manager, _, _) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("a", "1h"), &cid).unwrap();

        let err = manager.add(interval_job("a", "1h"), &cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        for err in [
            manager.update(interval_job("b", "1h"), &cid).unwrap_err(),
            manager.delete("b", &cid).unwrap_err(),
            manager.start_by_name("b", &cid).unwrap_err(),
            manager.stop_by_name("b", &cid).unwrap_err(),
            manager.trigger_by_name("b", &cid).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert_eq!(manager.state("a"), Some(EntryState::Registered));
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("a", "1h"), &cid).unwrap();

        manager.start_by_name("a", &cid).unwrap();
        settle().await;
        manager.start_by_name("a", &cid).unwrap();
        settle().await;
        assert_eq!(manager.state("a"), Some(EntryState::Running));
        // a second runner would have fired its own first instant
        assert_eq!(executor.calls(), 1);

        manager.stop_by_name("a", &cid).unwrap();
        manager.stop_by_name("a", &cid).unwrap();
        assert_eq!(manager.state("a"), Some(EntryState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn update_cancels_stale_start_timer() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(10_000, None), &cid).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.update(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(1_000, Some(2_000)), &cid).unwrap();

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(manager.state("j"), Some(EntryState::Running));
        assert_eq!(executor.calls(), 1);

        // past the stop timer and past where the stale start would have fired
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.state("j"), Some(EntryState::Stopped));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timers() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(5_000, Some(6_000)), &cid).unwrap();
        manager.arm("j", armed(1_000, None), &cid).unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        // the first stop timer never fires
        assert_eq!(manager.state("j"), Some(EntryState::Running));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_pending_timers() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(5_000, None), &cid).unwrap();
        manager.delete("j", &cid).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(executor.calls(), 0);
        assert!(!manager.contains("j"));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn locked_and_expired_arrangements_arm_nothing() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", Arrangement::Locked, &cid).unwrap();
        manager.arm("j", Arrangement::Expired, &cid).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.state("j"), Some(EntryState::Registered));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_fires_once_and_keeps_state() {
        let (manager, store, executor) = manager();
        let cid = CorrelationId::from("trigger-1");
        manager.add(interval_job("j", "1h"), &cid).unwrap();

        manager.trigger_by_name("j", &cid).unwrap().await.unwrap();
        assert_eq!(executor.calls(), 1);
        assert_eq!(manager.state("j"), Some(EntryState::Registered));

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Succeeded);
        assert_eq!(records[0].correlation_id, "trigger-1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_actions_are_recorded_as_failed() {
        let store = Arc::new(MemoryStore::default());
        let executor = Arc::new(CountingExecutor::failing());
        let manager = SchedulerManager::new(store.clone(), executor.clone());
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();

        manager.trigger_by_name("j", &cid).unwrap().await.unwrap();
        assert_eq!(store.records()[0].status, RecordStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_running_entries() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1s"), &cid).unwrap();
        manager.start_by_name("j", &cid).unwrap();
        settle().await;
        manager.shutdown();
        let fired = executor.calls();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.calls(), fired);
        assert_eq!(manager.state("j"), Some(EntryState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn start_instant_fires_even_if_the_wall_clock_lags() {
        let (manager, store, executor) = manager();
        let cid = CorrelationId::new();
        let start = Utc::now() + chrono::Duration::seconds(10);
        let mut job = interval_job("deferred", "1h");
        job.definition = job
            .definition
            .clone()
            .with_window(start.timestamp_millis(), 0);
        manager.add(job.clone(), &cid).unwrap();
        manager.arm("deferred", crate::arrange::arrange(Utc::now(), &job), &cid).unwrap();

        // virtual time runs ahead of the wall clock here, as after a clock step back
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(manager.state("deferred"), Some(EntryState::Running));
        assert_eq!(executor.calls(), 1);
        assert_eq!(store.records()[0].scheduled_at, start.timestamp_millis());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_that_lost_the_cancel_race_is_ignored() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(0, None), &cid).unwrap();
        let stale = manager.inner.entries.get("j").unwrap().generation;

        manager.update(interval_job("j", "1h"), &cid).unwrap();
        manager.arm("j", armed(0, Some(60_000)), &cid).unwrap();

        // a timer already past its sleep when it was aborted still runs its callback
        manager.inner.fire_timer("j", stale, TimerKind::Start, &cid);
        assert_eq!(manager.state("j"), Some(EntryState::Registered));
        assert!(manager.inner.entries.get("j").unwrap().runner.is_none());

        settle().await;
        assert_eq!(manager.state("j"), Some(EntryState::Running));
        manager.inner.fire_timer("j", stale, TimerKind::Stop, &cid);
        manager.inner.fire_timer("j", stale, TimerKind::Start, &cid);
        assert_eq!(manager.state("j"), Some(EntryState::Running));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_operations_leave_no_orphan_runners() {
        let (manager, store, _) = manager();
        let names = ["shared", "job-1", "job-2"];

        let mut workers = Vec::new();
        for worker in 0..8usize {
            let manager = manager.clone();
            workers.push(tokio::spawn(async move {
                let cid = CorrelationId::new();
                for step in 0..300usize {
                    let name = names[(worker + step) % names.len()];
                    let outcome = match (worker * 7 + step) % 6 {
                        0 => manager.add(interval_job(name, "20ms"), &cid),
                        1 => manager.update(interval_job(name, "20ms"), &cid),
                        2 => manager.arm(name, armed(0, Some(30)), &cid),
                        3 => manager.start_by_name(name, &cid),
                        4 => manager.stop_by_name(name, &cid),
                        _ => manager.delete(name, &cid),
                    };
                    if let Err(e) = outcome {
                        assert!(
                            matches!(e.kind(), ErrorKind::NotFound | ErrorKind::AlreadyExists),
                            "unexpected error: {e}"
                        );
                    }
                    if step % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(10), worker)
                .await
                .expect("registry operations stalled")
                .unwrap();
        }

        let cid = CorrelationId::new();
        for name in names {
            let _ = manager.delete(name, &cid);
        }
        assert!(manager.is_empty());

        // aborted runners finish their current poll at most once more
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = store.records().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.records().len(), settled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_starts_spawn_a_single_runner() {
        let (manager, _, executor) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("once", "1h"), &cid).unwrap();

        let mut workers = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let cid = cid.clone();
            workers.push(tokio::spawn(async move {
                manager.start_by_name("once", &cid).unwrap();
                manager.arm("once", armed(0, None), &cid).unwrap();
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.state("once"), Some(EntryState::Running));
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn arming_requires_a_runtime() {
        let (manager, _, _) = manager();
        let cid = CorrelationId::new();
        manager.add(interval_job("j", "1h"), &cid).unwrap();
        let err = manager.arm("j", armed(0, None), &cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        // nothing to arm for a locked job, runtime or not
        assert!(manager.arm("j", Arrangement::Locked, &cid).is_ok());
    }
}

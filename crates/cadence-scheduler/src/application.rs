//! Request-level operations: validation, registry and store calls in the
//! right order, and the startup reload.
//!
//! Registry mutation precedes persistence on add/update and follows it on
//! delete; timers are only armed once both sides agree.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use cadence_core::config::RetentionConfig;
use cadence_core::{
    CadenceError, CorrelationId, ErrorKind, Result, ScheduleActionRecord, ScheduleJob,
    ScheduleJobPatch, ScheduleStore,
};

use crate::arrange::arrange;
use crate::manager::SchedulerManager;
use crate::purge::spawn_purger;
use crate::reconcile::reconcile;

/// Outcome of [`ScheduleApp::load_schedule_jobs`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Jobs registered in the manager.
    pub loaded: usize,
    /// `Missed` records written by reconciliation.
    pub missed_records: usize,
    /// Per-job failures; a job may appear once per failed stage.
    pub failures: Vec<(String, CadenceError)>,
}

pub struct ScheduleApp {
    store: Arc<dyn ScheduleStore>,
    manager: SchedulerManager,
}

impl ScheduleApp {
    pub fn new(store: Arc<dyn ScheduleStore>, manager: SchedulerManager) -> Self {
        Self { store, manager }
    }

    pub fn manager(&self) -> &SchedulerManager {
        &self.manager
    }

    /// Validate, register, persist, then arm. Returns the new job id.
    #[instrument(skip(self, job), fields(job = %job.name, correlation_id = %correlation_id))]
    pub fn add_schedule_job(
        &self,
        job: ScheduleJob,
        correlation_id: &CorrelationId,
    ) -> Result<String> {
        job.validate()?;

        let now = Utc::now().timestamp_millis();
        let mut job = job.with_fresh_action_ids();
        job.id = Uuid::new_v4().to_string();
        job.created = now;
        job.modified = now;

        self.manager.add(job.clone(), correlation_id)?;
        if let Err(e) = self.store.add_job(&job) {
            self.rollback_registration(&job.name, correlation_id);
            return Err(e.with_context(format!("adding scheduled job '{}'", job.name)));
        }

        if let Err(e) = self.arm(&job, correlation_id) {
            if let Err(undo) = self.store.delete_job_by_name(&job.name) {
                error!(job = %job.name, error = %undo, "failed to undo persisted job");
            }
            self.rollback_registration(&job.name, correlation_id);
            return Err(e);
        }

        info!(id = %job.id, "scheduled job added");
        Ok(job.id)
    }

    /// Apply a partial update located by id or name. When both are given
    /// and the name differs from the stored one, the job is renamed.
    #[instrument(skip(self, patch), fields(correlation_id = %correlation_id))]
    pub fn patch_schedule_job(
        &self,
        patch: ScheduleJobPatch,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        let id = patch.id.as_deref().filter(|s| !s.trim().is_empty());
        let name = patch.name.as_deref().filter(|s| !s.trim().is_empty());
        let existing = match (id, name) {
            (Some(id), _) => self.store.job_by_id(id),
            (None, Some(name)) => self.store.job_by_name(name),
            (None, None) => {
                return Err(CadenceError::ContractInvalid(
                    "either id or name of the scheduled job is required".into(),
                ))
            }
        }
        .map_err(|e| e.with_context("loading scheduled job to update"))?;

        let mut job = existing.clone();
        patch.apply_to(&mut job);
        let renamed = match (id, name) {
            (Some(_), Some(new_name)) if new_name != existing.name => {
                job.name = new_name.to_string();
                true
            }
            _ => false,
        };
        if patch.actions.is_some() {
            job = job.with_fresh_action_ids();
        }
        job.modified = Utc::now().timestamp_millis();
        job.validate()?;

        if renamed {
            self.rename(&existing, &job, correlation_id)?;
        } else {
            self.manager.update(job.clone(), correlation_id)?;
            if let Err(e) = self.store.update_job(&job) {
                self.restore(&existing, correlation_id);
                return Err(e.with_context(format!("updating scheduled job '{}'", job.name)));
            }
        }

        self.arm(&job, correlation_id)?;
        info!(job = %job.name, "scheduled job updated");
        Ok(())
    }

    /// Remove from the store first, then from the registry.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub fn delete_schedule_job_by_name(
        &self,
        name: &str,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        require_name(name)?;
        self.store
            .delete_job_by_name(name)
            .map_err(|e| e.with_context(format!("deleting scheduled job '{name}'")))?;
        if let Err(e) = self.manager.delete(name, correlation_id) {
            // store wins; the registry was already out of step
            warn!(job = %name, error = %e, "deleted job was not registered");
        }
        info!(job = %name, "scheduled job deleted");
        Ok(())
    }

    /// Fire the job's actions once, out of band.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub fn trigger_schedule_job_by_name(
        &self,
        name: &str,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        require_name(name)?;
        self.manager.trigger_by_name(name, correlation_id)?;
        Ok(())
    }

    pub fn schedule_job_by_name(&self, name: &str) -> Result<ScheduleJob> {
        require_name(name)?;
        self.store.job_by_name(name)
    }

    /// A page of jobs plus the total count matching `labels`.
    pub fn all_schedule_jobs(
        &self,
        labels: &[String],
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ScheduleJob>, u32)> {
        let total = self.store.job_count(labels)?;
        if total == 0 {
            return Ok((Vec::new(), 0));
        }
        Ok((self.store.all_jobs(labels, offset, limit)?, total))
    }

    pub fn schedule_action_records_by_job_name(
        &self,
        name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScheduleActionRecord>> {
        require_name(name)?;
        self.store.records_by_job_name(name, offset, limit)
    }

    /// Startup reload: register every stored job (up to
    /// `max_result_count`), write missed records, then arm.
    ///
    /// Only a failure to list the jobs is returned as an error; anything
    /// that goes wrong for a single job lands in the report.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub fn load_schedule_jobs(
        &self,
        max_result_count: i64,
        correlation_id: &CorrelationId,
    ) -> Result<LoadReport> {
        let jobs = self
            .store
            .all_jobs(&[], 0, max_result_count)
            .map_err(|e| e.with_context("loading all existing scheduled jobs"))?;

        let now = Utc::now();
        let mut report = LoadReport::default();
        for job in jobs {
            if let Err(e) = self.manager.add(job.clone(), correlation_id) {
                error!(job = %job.name, error = %e, "failed to register stored job");
                report.failures.push((job.name, e));
                continue;
            }
            report.loaded += 1;

            // reconcile before arming so a live firing cannot move the lower bound
            match reconcile(self.store.as_ref(), &job, now, correlation_id) {
                Ok(n) => report.missed_records += n,
                Err(e) => {
                    error!(job = %job.name, error = %e, "failed to generate missed records");
                    report.failures.push((job.name.clone(), e));
                }
            }

            if let Err(e) = self.arm(&job, correlation_id) {
                error!(job = %job.name, error = %e, "failed to arrange stored job");
                report.failures.push((job.name.clone(), e));
                continue;
            }
            debug!(job = %job.name, "stored job loaded");
        }

        info!(
            loaded = report.loaded,
            missed = report.missed_records,
            failed = report.failures.len(),
            "scheduled jobs loaded"
        );
        Ok(report)
    }

    /// Spawn the retention purger when enabled.
    pub fn start_retention(
        &self,
        config: &RetentionConfig,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        if !config.enabled {
            info!("retention disabled");
            return Ok(None);
        }
        let interval = config.interval()?;
        let max_age = config.max_age()?;
        Ok(Some(spawn_purger(Arc::clone(&self.store), interval, max_age, cancel)))
    }

    fn arm(&self, job: &ScheduleJob, correlation_id: &CorrelationId) -> Result<()> {
        self.manager
            .arm(&job.name, arrange(Utc::now(), job), correlation_id)
            .map_err(|e| e.with_context(format!("arranging scheduled job '{}'", job.name)))
    }

    fn rename(
        &self,
        existing: &ScheduleJob,
        job: &ScheduleJob,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        match self.store.job_by_name(&job.name) {
            Ok(_) => {
                return Err(CadenceError::AlreadyExists(format!(
                    "cannot rename '{}': scheduled job '{}' already exists",
                    existing.name, job.name
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.with_context(format!("checking name '{}'", job.name))),
        }

        self.manager.add(job.clone(), correlation_id)?;
        if let Err(e) = self.store.update_job(job) {
            self.rollback_registration(&job.name, correlation_id);
            return Err(e.with_context(format!("renaming scheduled job '{}'", existing.name)));
        }
        if let Err(e) = self.manager.delete(&existing.name, correlation_id) {
            warn!(job = %existing.name, error = %e, "renamed job was not registered");
        }
        Ok(())
    }

    fn rollback_registration(&self, name: &str, correlation_id: &CorrelationId) {
        if let Err(e) = self.manager.delete(name, correlation_id) {
            error!(job = %name, error = %e, "failed to roll back registry entry");
        }
    }

    /// Put the previous definition back into the registry after a failed update.
    fn restore(&self, previous: &ScheduleJob, correlation_id: &CorrelationId) {
        let restored = self
            .manager
            .update(previous.clone(), correlation_id)
            .and_then(|_| self.arm(previous, correlation_id));
        if let Err(e) = restored {
            error!(job = %previous.name, error = %e, "failed to restore previous schedule");
        }
    }
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CadenceError::ContractInvalid("name is required".into()));
    }
    Ok(())
}

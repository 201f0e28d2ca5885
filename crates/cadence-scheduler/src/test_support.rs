//! In-memory fakes shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use cadence_core::{
    ActionTarget, CadenceError, CorrelationId, Result, ScheduleAction, ScheduleActionRecord,
    ScheduleDefinition, ScheduleJob, ScheduleStore,
};

use crate::executor::ActionExecutor;

pub(crate) fn rest_action(id: &str) -> ScheduleAction {
    let mut action = ScheduleAction::new(
        ActionTarget::Rest {
            method: "POST".into(),
            address: "http://localhost:59880/api/v3/report".into(),
            content_type: None,
        },
        serde_json::json!({ "kind": "test" }),
    );
    action.id = id.to_string();
    action
}

pub(crate) fn interval_job(name: &str, interval: &str) -> ScheduleJob {
    ScheduleJob::new(
        name,
        ScheduleDefinition::interval(interval),
        vec![rest_action(&format!("{name}-action"))],
    )
}

/// `ScheduleStore` over two vectors, with switches to simulate failures.
#[derive(Default)]
pub(crate) struct MemoryStore {
    jobs: Mutex<Vec<ScheduleJob>>,
    records: Mutex<Vec<ScheduleActionRecord>>,
    batches: Mutex<Vec<usize>>,
    pub fail_jobs: AtomicBool,
    pub fail_records: AtomicBool,
}

impl MemoryStore {
    pub fn records(&self) -> Vec<ScheduleActionRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Sizes of the `add_records` calls seen so far, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub fn seed_records(&self, records: Vec<ScheduleActionRecord>) {
        self.records.lock().unwrap().extend(records);
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CadenceError::Database("simulated failure".into()));
        }
        Ok(())
    }
}

impl ScheduleStore for MemoryStore {
    fn add_job(&self, job: &ScheduleJob) -> Result<ScheduleJob> {
        self.check(&self.fail_jobs)?;
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|j| j.name == job.name) {
            return Err(CadenceError::AlreadyExists(job.name.clone()));
        }
        jobs.push(job.clone());
        Ok(job.clone())
    }

    fn update_job(&self, job: &ScheduleJob) -> Result<()> {
        self.check(&self.fail_jobs)?;
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| CadenceError::NotFound(job.id.clone()))?;
        let previous_name = std::mem::replace(slot, job.clone()).name;
        if previous_name != job.name {
            for record in self.records.lock().unwrap().iter_mut() {
                if record.job_name == previous_name {
                    record.job_name = job.name.clone();
                }
            }
        }
        Ok(())
    }

    fn delete_job_by_name(&self, name: &str) -> Result<()> {
        self.check(&self.fail_jobs)?;
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        if jobs.len() == before {
            return Err(CadenceError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn job_by_name(&self, name: &str) -> Result<ScheduleJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.name == name)
            .cloned()
            .ok_or_else(|| CadenceError::NotFound(name.to_string()))
    }

    fn job_by_id(&self, id: &str) -> Result<ScheduleJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| CadenceError::NotFound(id.to_string()))
    }

    fn all_jobs(&self, labels: &[String], offset: i64, limit: i64) -> Result<Vec<ScheduleJob>> {
        self.check(&self.fail_jobs)?;
        let jobs = self.jobs.lock().unwrap();
        let matching = jobs
            .iter()
            .filter(|j| labels.is_empty() || j.labels.iter().any(|l| labels.contains(l)))
            .skip(offset.max(0) as usize);
        Ok(if limit < 0 {
            matching.cloned().collect()
        } else {
            matching.take(limit as usize).cloned().collect()
        })
    }

    fn job_count(&self, labels: &[String]) -> Result<u32> {
        Ok(self.all_jobs(labels, 0, -1)?.len() as u32)
    }

    fn add_records(&self, records: &[ScheduleActionRecord]) -> Result<()> {
        self.check(&self.fail_records)?;
        self.batches.lock().unwrap().push(records.len());
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    fn latest_records_by_job_name(&self, name: &str) -> Result<Vec<ScheduleActionRecord>> {
        self.check(&self.fail_records)?;
        let records = self.records.lock().unwrap();
        let mut latest: Vec<ScheduleActionRecord> = Vec::new();
        for record in records.iter().filter(|r| r.job_name == name) {
            match latest.iter_mut().find(|r| r.action_id == record.action_id) {
                Some(existing) if existing.scheduled_at < record.scheduled_at => {
                    *existing = record.clone()
                }
                Some(_) => {}
                None => latest.push(record.clone()),
            }
        }
        Ok(latest)
    }

    fn records_by_job_name(
        &self,
        name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScheduleActionRecord>> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.job_name == name)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        let page = records.into_iter().skip(offset.max(0) as usize);
        Ok(if limit < 0 {
            page.collect()
        } else {
            page.take(limit as usize).collect()
        })
    }

    fn delete_records_older_than(&self, timestamp: i64) -> Result<u64> {
        self.check(&self.fail_records)?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.scheduled_at >= timestamp);
        Ok((before - records.len()) as u64)
    }
}

/// Counts invocations; optionally fails every one of them.
#[derive(Default)]
pub(crate) struct CountingExecutor {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingExecutor {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(
        &self,
        _job: &ScheduleJob,
        _action: &ScheduleAction,
        _correlation_id: &CorrelationId,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CadenceError::Server("target unavailable".into()));
        }
        Ok(())
    }
}

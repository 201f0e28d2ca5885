//! `cadence-service`: wiring of store, executor, scheduler manager and
//! facade into a running service.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence_core::config::CadenceConfig;
use cadence_core::{CadenceError, CorrelationId, Result, ScheduleStore};
use cadence_scheduler::{ActionExecutor, LoadReport, ScheduleApp, SchedulerManager};
use cadence_store::SqliteStore;

/// Open (creating if needed) the SQLite database at `path` and run the
/// schema migrations.
pub fn open_database(path: &str) -> Result<Connection> {
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");

    let db = Connection::open(path)
        .map_err(|e| CadenceError::Database(format!("failed to open {path}: {e}")))?;
    db.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| CadenceError::Database(format!("failed to enable WAL: {e}")))?;
    cadence_store::db::init_db(&db)?;
    info!("database migrations complete");
    Ok(db)
}

/// A started service: jobs loaded, timers armed, retention running.
pub struct Service {
    app: ScheduleApp,
    report: LoadReport,
    cancel: CancellationToken,
    purger: Option<JoinHandle<()>>,
}

impl Service {
    /// Bootstrap the scheduler against `config`. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: &CadenceConfig, executor: Arc<dyn ActionExecutor>) -> Result<Self> {
        let db = open_database(&config.database.path)?;
        let store: Arc<dyn ScheduleStore> = Arc::new(SqliteStore::new(db));
        let manager = SchedulerManager::new(Arc::clone(&store), executor);
        let app = ScheduleApp::new(store, manager);

        let correlation_id = CorrelationId::new();
        let report = app.load_schedule_jobs(config.service.max_result_count, &correlation_id)?;
        for (job, error) in &report.failures {
            warn!(%job, %error, correlation_id = %correlation_id, "job not fully loaded");
        }

        let cancel = CancellationToken::new();
        let purger = app.start_retention(&config.retention, cancel.clone())?;

        info!(jobs = report.loaded, "cadence scheduler ready");
        Ok(Self {
            app,
            report,
            cancel,
            purger,
        })
    }

    pub fn app(&self) -> &ScheduleApp {
        &self.app
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    /// Stop the retention loop and abort every timer and runner.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(purger) = self.purger {
            if let Err(e) = purger.await {
                warn!(error = %e, "retention purger ended abnormally");
            }
        }
        self.app.manager().shutdown();
        info!("cadence scheduler stopped");
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

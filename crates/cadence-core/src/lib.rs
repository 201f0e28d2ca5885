//! `cadence-core`: domain model, error taxonomy, configuration and the
//! persistence contract shared by every cadence crate.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use error::{CadenceError, ErrorKind, Result};
pub use store::ScheduleStore;
pub use types::{
    ActionTarget, AdminState, CorrelationId, RecordStatus, ScheduleAction, ScheduleActionRecord,
    ScheduleDef, ScheduleDefinition, ScheduleJob, ScheduleJobPatch,
};

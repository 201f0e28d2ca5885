use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::parse_duration;
use crate::error::{CadenceError, Result};

/// Opaque tracing token threaded through one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Reuse the caller's id when present, otherwise mint a fresh one.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Operator-controlled lock flag. Locked jobs are persisted but never armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdminState {
    Locked,
    #[default]
    Unlocked,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Locked => write!(f, "LOCKED"),
            AdminState::Unlocked => write!(f, "UNLOCKED"),
        }
    }
}

impl std::str::FromStr for AdminState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LOCKED" => Ok(AdminState::Locked),
            "UNLOCKED" => Ok(AdminState::Unlocked),
            other => Err(format!("unknown admin state: {other}")),
        }
    }
}

/// Recurrence rule of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ScheduleDef {
    /// Fire every `interval` (duration string, e.g. `"10m"`).
    Interval { interval: String },

    /// Fire on a 5- or 6-field cron expression, evaluated in UTC.
    Cron { crontab: String },
}

/// Recurrence rule plus the absolute window it is allowed to fire in.
///
/// Timestamps are epoch milliseconds; `0` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    #[serde(flatten)]
    pub def: ScheduleDef,
    #[serde(default)]
    pub start_timestamp: i64,
    #[serde(default)]
    pub end_timestamp: i64,
}

impl ScheduleDefinition {
    pub fn interval(interval: impl Into<String>) -> Self {
        Self {
            def: ScheduleDef::Interval {
                interval: interval.into(),
            },
            start_timestamp: 0,
            end_timestamp: 0,
        }
    }

    pub fn cron(crontab: impl Into<String>) -> Self {
        Self {
            def: ScheduleDef::Cron {
                crontab: crontab.into(),
            },
            start_timestamp: 0,
            end_timestamp: 0,
        }
    }

    pub fn with_window(mut self, start_timestamp: i64, end_timestamp: i64) -> Self {
        self.start_timestamp = start_timestamp;
        self.end_timestamp = end_timestamp;
        self
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        bound(self.start_timestamp)
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        bound(self.end_timestamp)
    }
}

fn bound(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// What an action invokes when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTarget {
    /// Plain HTTP call.
    Rest {
        method: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },

    /// Write a device resource through the core-command service.
    #[serde(rename_all = "camelCase")]
    DeviceControl {
        device_name: String,
        source_name: String,
    },
}

/// One executable unit within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAction {
    #[serde(default)]
    pub id: String,
    pub target: ActionTarget,
    /// Opaque payload forwarded to the target.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ScheduleAction {
    pub fn new(target: ActionTarget, payload: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            target,
            payload,
        }
    }

    /// Copy of this action carrying a freshly generated id.
    pub fn with_fresh_id(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.target {
            ActionTarget::Rest {
                method, address, ..
            } => {
                if method.trim().is_empty() || address.trim().is_empty() {
                    return Err(CadenceError::ContractInvalid(
                        "REST action requires a method and an address".into(),
                    ));
                }
            }
            ActionTarget::DeviceControl {
                device_name,
                source_name,
            } => {
                if device_name.trim().is_empty() || source_name.trim().is_empty() {
                    return Err(CadenceError::ContractInvalid(
                        "device control action requires a device and a source name".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A named, user-managed scheduling unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleJob {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub admin_state: AdminState,
    pub definition: ScheduleDefinition,
    pub actions: Vec<ScheduleAction>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub modified: i64,
}

impl ScheduleJob {
    pub fn new(
        name: impl Into<String>,
        definition: ScheduleDefinition,
        actions: Vec<ScheduleAction>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            admin_state: AdminState::Unlocked,
            definition,
            actions,
            labels: Vec::new(),
            created: 0,
            modified: 0,
        }
    }

    pub fn with_admin_state(mut self, admin_state: AdminState) -> Self {
        self.admin_state = admin_state;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.admin_state == AdminState::Locked
    }

    /// Discard client-supplied action ids so new history can never collide
    /// with records written for a previous definition.
    pub fn with_fresh_action_ids(mut self) -> Self {
        self.actions = self.actions.iter().map(ScheduleAction::with_fresh_id).collect();
        self
    }

    /// Acceptance preconditions checked at the boundary, before the registry
    /// or the store ever see the job.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CadenceError::ContractInvalid("name is empty".into()));
        }
        if self.actions.is_empty() {
            return Err(CadenceError::ContractInvalid(format!(
                "scheduled job '{}' has no actions",
                self.name
            )));
        }
        let def = &self.definition;
        if def.start_timestamp < 0 || def.end_timestamp < 0 {
            return Err(CadenceError::ContractInvalid(
                "timestamps must not be negative".into(),
            ));
        }
        if def.end_timestamp != 0 && def.end_timestamp < def.start_timestamp {
            return Err(CadenceError::ContractInvalid(format!(
                "endTimestamp {} is before startTimestamp {}",
                def.end_timestamp, def.start_timestamp
            )));
        }
        match &def.def {
            ScheduleDef::Interval { interval } => {
                parse_duration(interval).map_err(|e| {
                    CadenceError::ContractInvalid(format!("invalid interval: {e}"))
                })?;
            }
            ScheduleDef::Cron { crontab } => {
                if crontab.trim().is_empty() {
                    return Err(CadenceError::ContractInvalid("crontab is empty".into()));
                }
            }
        }
        self.actions.iter().try_for_each(ScheduleAction::validate)
    }
}

/// Partial replacement of a stored job, located by `id` or `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleJobPatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub admin_state: Option<AdminState>,
    pub definition: Option<ScheduleDefinition>,
    pub actions: Option<Vec<ScheduleAction>>,
    pub labels: Option<Vec<String>>,
}

impl ScheduleJobPatch {
    /// Overwrite the fields present in the patch; `id` and `name` are
    /// lookup keys and handled by the caller.
    pub fn apply_to(&self, job: &mut ScheduleJob) {
        if let Some(state) = self.admin_state {
            job.admin_state = state;
        }
        if let Some(ref definition) = self.definition {
            job.definition = definition.clone();
        }
        if let Some(ref actions) = self.actions {
            job.actions = actions.clone();
        }
        if let Some(ref labels) = self.labels {
            job.labels = labels.clone();
        }
    }
}

/// Outcome of one action at one scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Succeeded,
    Failed,
    /// The instant passed while the scheduler was not running.
    Missed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Succeeded => "SUCCEEDED",
            RecordStatus::Failed => "FAILED",
            RecordStatus::Missed => "MISSED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SUCCEEDED" => Ok(RecordStatus::Succeeded),
            "FAILED" => Ok(RecordStatus::Failed),
            "MISSED" => Ok(RecordStatus::Missed),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Append-only execution-history fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleActionRecord {
    pub id: String,
    pub job_name: String,
    pub action_id: String,
    /// Snapshot of the action as it was when the record was written.
    pub action: ScheduleAction,
    /// Epoch ms of the instant the action was expected to fire.
    pub scheduled_at: i64,
    pub status: RecordStatus,
    pub correlation_id: String,
    pub created: i64,
}

impl ScheduleActionRecord {
    pub fn new(
        job_name: &str,
        action: &ScheduleAction,
        scheduled_at: DateTime<Utc>,
        status: RecordStatus,
        correlation_id: &CorrelationId,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_name: job_name.to_string(),
            action_id: action.id.clone(),
            action: action.clone(),
            scheduled_at: scheduled_at.timestamp_millis(),
            status,
            correlation_id: correlation_id.to_string(),
            created: Utc::now().timestamp_millis(),
        }
    }
}

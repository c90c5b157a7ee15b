use crate::errors::ScheduleError;
use crate::schedule::ScheduleTrigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Connector configuration: field name to value
pub type Configuration = HashMap<String, serde_json::Value>;

// ============================================================================
// Sync Job Models
// ============================================================================

/// JobType defines the kind of synchronization a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Full,
    Incremental,
    AccessControl,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Full => "full",
            JobType::Incremental => "incremental",
            JobType::AccessControl => "access_control",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(JobType::Full),
            "incremental" => Ok(JobType::Incremental),
            "access_control" => Ok(JobType::AccessControl),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// JobTriggerMethod records how a sync job came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTriggerMethod {
    OnDemand,
    Scheduled,
}

impl JobTriggerMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTriggerMethod::OnDemand => "on_demand",
            JobTriggerMethod::Scheduled => "scheduled",
        }
    }
}

impl FromStr for JobTriggerMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_demand" => Ok(JobTriggerMethod::OnDemand),
            "scheduled" => Ok(JobTriggerMethod::Scheduled),
            other => Err(format!("unknown trigger method '{}'", other)),
        }
    }
}

/// SyncJob is an immutable request to synchronize one connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub connector_id: String,
    pub job_type: JobType,
    pub trigger_method: JobTriggerMethod,
    pub created_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(connector_id: &str, job_type: JobType, trigger_method: JobTriggerMethod) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector_id: connector_id.to_string(),
            job_type,
            trigger_method,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Connector Models
// ============================================================================

/// ConnectorStatus is the lifecycle state stored on the connector record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Created,
    NeedsConfiguration,
    Configured,
    Connected,
    Error,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Created => "created",
            ConnectorStatus::NeedsConfiguration => "needs_configuration",
            ConnectorStatus::Configured => "configured",
            ConnectorStatus::Connected => "connected",
            ConnectorStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ConnectorStatus::Created),
            "needs_configuration" => Ok(ConnectorStatus::NeedsConfiguration),
            "configured" => Ok(ConnectorStatus::Configured),
            "connected" => Ok(ConnectorStatus::Connected),
            "error" => Ok(ConnectorStatus::Error),
            other => Err(format!("unknown connector status '{}'", other)),
        }
    }
}

/// Feature flags toggled per connector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub sync_rules_enabled: bool,
    #[serde(default)]
    pub document_level_security_enabled: bool,
    #[serde(default)]
    pub incremental_sync_enabled: bool,
}

/// Scheduling policy for one job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchedule {
    pub enabled: bool,
    /// Quartz-style cron expression with second precision
    pub interval: String,
}

impl SyncSchedule {
    pub fn every(interval: impl Into<String>) -> Self {
        Self {
            enabled: true,
            interval: interval.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            interval: String::new(),
        }
    }
}

/// Per-job-type scheduling policies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<SyncSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<SyncSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<SyncSchedule>,
}

impl SchedulingConfig {
    pub fn for_job_type(&self, job_type: JobType) -> Option<&SyncSchedule> {
        match job_type {
            JobType::Full => self.full.as_ref(),
            JobType::Incremental => self.incremental.as_ref(),
            JobType::AccessControl => self.access_control.as_ref(),
        }
    }

    pub fn set(&mut self, job_type: JobType, schedule: SyncSchedule) {
        match job_type {
            JobType::Full => self.full = Some(schedule),
            JobType::Incremental => self.incremental = Some(schedule),
            JobType::AccessControl => self.access_control = Some(schedule),
        }
    }
}

/// Last-scheduled-at timestamps, one per job type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastScheduled {
    pub full: Option<DateTime<Utc>>,
    pub incremental: Option<DateTime<Utc>>,
    pub access_control: Option<DateTime<Utc>>,
}

impl LastScheduled {
    pub fn get(&self, job_type: JobType) -> Option<DateTime<Utc>> {
        match job_type {
            JobType::Full => self.full,
            JobType::Incremental => self.incremental,
            JobType::AccessControl => self.access_control,
        }
    }

    pub fn set(&mut self, job_type: JobType, at: DateTime<Utc>) {
        match job_type {
            JobType::Full => self.full = Some(at),
            JobType::Incremental => self.incremental = Some(at),
            JobType::AccessControl => self.access_control = Some(at),
        }
    }
}

/// FilteringRule is a single draft sync rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringRule {
    pub id: String,
    pub field: String,
    /// "include" or "exclude"
    pub policy: String,
    /// "equals", "contains", "starts_with", "ends_with", "regex", ">" or "<"
    pub rule: String,
    pub value: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilteringValidationState {
    Valid,
    Invalid,
    Edited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringValidationError {
    pub ids: Vec<String>,
    pub messages: Vec<String>,
}

/// Result of validating draft filtering rules against an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringValidation {
    pub state: FilteringValidationState,
    #[serde(default)]
    pub errors: Vec<FilteringValidationError>,
}

impl FilteringValidation {
    pub fn valid() -> Self {
        Self {
            state: FilteringValidationState::Valid,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<FilteringValidationError>) -> Self {
        Self {
            state: FilteringValidationState::Invalid,
            errors,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filtering {
    #[serde(default)]
    pub rules: Vec<FilteringRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FilteringValidation>,
}

/// Connector is the registry record of one synchronization source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub service_type: Option<String>,
    #[serde(default)]
    pub configuration: Configuration,
    pub status: ConnectorStatus,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub last_sync_scheduled_at: LastScheduled,
    pub last_seen: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub is_native: bool,
    #[serde(default)]
    pub filtering: Filtering,
    /// Incremented on every write; used for conditional updates
    pub version: i64,
}

impl Connector {
    /// A freshly registered connector
    pub fn new(id: impl Into<String>, service_type: Option<&str>) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.map(str::to_string),
            configuration: Configuration::new(),
            status: ConnectorStatus::Created,
            features: Features::default(),
            scheduling: SchedulingConfig::default(),
            last_sync_scheduled_at: LastScheduled::default(),
            last_seen: None,
            error: None,
            is_native: false,
            filtering: Filtering::default(),
            version: 1,
        }
    }

    pub fn last_sync_scheduled_at_by_job_type(&self, job_type: JobType) -> Option<DateTime<Utc>> {
        self.last_sync_scheduled_at.get(job_type)
    }

    /// Next due time for a job type, or `None` when scheduling for it is disabled
    pub fn next_sync(
        &self,
        job_type: JobType,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self.scheduling.for_job_type(job_type) {
            Some(schedule) => schedule.next_execution_time(after),
            None => Ok(None),
        }
    }

    /// Whether a heartbeat should be written at `now`
    pub fn needs_heartbeat(&self, interval: Duration, now: DateTime<Utc>, force: bool) -> bool {
        if force {
            return true;
        }
        match self.last_seen {
            None => true,
            Some(last_seen) => (now - last_seen)
                .to_std()
                .map(|elapsed| elapsed > interval)
                .unwrap_or(false),
        }
    }
}

// ============================================================================
// License Models
// ============================================================================

/// License level of the registry cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum License {
    Basic,
    Gold,
    Platinum,
    Enterprise,
    Trial,
    Expired,
    Unset,
}

impl License {
    /// Position in the license hierarchy; `None` for licenses that grant nothing
    fn rank(&self) -> Option<u8> {
        match self {
            License::Basic => Some(0),
            License::Gold => Some(1),
            License::Platinum => Some(2),
            License::Enterprise => Some(3),
            License::Trial => Some(4),
            License::Expired | License::Unset => None,
        }
    }

    /// Whether this license grants features that require `minimum`
    pub fn satisfies(&self, minimum: License) -> bool {
        match (self.rank(), minimum.rank()) {
            (Some(actual), Some(required)) => actual >= required,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            License::Basic => "basic",
            License::Gold => "gold",
            License::Platinum => "platinum",
            License::Enterprise => "enterprise",
            License::Trial => "trial",
            License::Expired => "expired",
            License::Unset => "unset",
        }
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for License {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(License::Basic),
            "gold" => Ok(License::Gold),
            "platinum" => Ok(License::Platinum),
            "enterprise" => Ok(License::Enterprise),
            "trial" => Ok(License::Trial),
            "expired" => Ok(License::Expired),
            "unset" => Ok(License::Unset),
            other => Err(format!("unknown license '{}'", other)),
        }
    }
}

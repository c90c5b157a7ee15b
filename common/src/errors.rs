// Error handling framework
// Per-concern error enums plus the tagged per-connector outcome used by the scheduler

use crate::models::ConnectorStatus;
use std::fmt;
use thiserror::Error;

/// Errors raised while evaluating a connector's scheduling policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Cron expression '{expression}' has no upcoming execution")]
    NoNextExecution { expression: String },
}

/// Registry (connector/job store) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connector not found: {0}")]
    NotFound(String),

    #[error("Version conflict on connector {connector_id}: expected version {expected}")]
    Conflict { connector_id: String, expected: i64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid registry record: {0}")]
    InvalidRecord(String),

    #[error("Registry is closed")]
    Closed,
}

impl RegistryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RegistryError::NotFound("Record not found".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                RegistryError::InvalidRecord(format!("column {}: {}", index, source))
            }
            _ => RegistryError::Database(err.to_string()),
        }
    }
}

/// Structural data source errors: the service cannot map a connector to an adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataSourceError {
    #[error("Couldn't find data source class for {0}")]
    UnknownServiceType(String),

    #[error("Data source adapter '{adapter}' configured for service type '{service_type}' is not available")]
    UnknownAdapter {
        service_type: String,
        adapter: String,
    },
}

/// Runtime errors reported by a data source adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Missing required configuration field: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Data source unreachable: {0}")]
    Unreachable(String),

    #[error("Filtering validation failed: {0}")]
    Filtering(String),
}

/// Errors raised while preparing a connector record for scheduling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    #[error("Couldn't find connector {0}")]
    NotFound(String),

    #[error("Service type is not configured for connector {0}")]
    ServiceTypeNotConfigured(String),

    #[error("Can't handle source of type {0}")]
    ServiceTypeNotSupported(String),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error("Registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for PrepareError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => PrepareError::NotFound(id),
            other => PrepareError::Registry(other),
        }
    }
}

/// Why a connector's scheduling cycle stopped early without escalating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ShuttingDown,
    NotFound,
    ServiceTypeNotConfigured,
    ServiceTypeNotSupported(String),
    NotActionable(ConnectorStatus),
    SourceFailure(String),
    Registry(String),
}

impl SkipReason {
    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::ShuttingDown => "shutting_down",
            SkipReason::NotFound => "not_found",
            SkipReason::ServiceTypeNotConfigured => "service_type_not_configured",
            SkipReason::ServiceTypeNotSupported(_) => "service_type_not_supported",
            SkipReason::NotActionable(_) => "not_actionable",
            SkipReason::SourceFailure(_) => "source_failure",
            SkipReason::Registry(_) => "registry",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ShuttingDown => write!(f, "service is terminating"),
            SkipReason::NotFound => write!(f, "connector not found"),
            SkipReason::ServiceTypeNotConfigured => write!(f, "service type is not configured"),
            SkipReason::ServiceTypeNotSupported(service_type) => {
                write!(f, "service type '{}' is not supported", service_type)
            }
            SkipReason::NotActionable(status) => write!(f, "connector status is '{}'", status),
            SkipReason::SourceFailure(message) => write!(f, "data source check failed: {}", message),
            SkipReason::Registry(message) => write!(f, "registry error: {}", message),
        }
    }
}

/// Outcome of a single connector's scheduling cycle when it does not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Isolated to this connector's cycle
    #[error("Connector skipped: {0}")]
    Skip(SkipReason),

    /// Structural misconfiguration surfaced to the poll loop
    #[error(transparent)]
    Fatal(#[from] DataSourceError),
}

/// Errors surfaced by the poll loop / driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler cannot start from state '{0}'")]
    InvalidState(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

impl SchedulerError {
    /// Error kind name matched against the configured spurious error kinds
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::InvalidState(_) => "state",
            SchedulerError::Registry(_) => "registry",
            SchedulerError::DataSource(_) => "data_source",
        }
    }
}

// Per-connector scheduling task: readiness gate followed by the sync-type waterfall

use super::planner::{SchedulingWindow, SyncAttempt};
use crate::concurrency::ConflictBackoff;
use crate::config::LocalConnectorConfig;
use crate::errors::{ConnectorError, RegistryError};
use crate::models::Connector;
use crate::registry::ConnectorRegistry;
use crate::sources::SourceCatalog;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Per-cycle inputs shared by every connector task of one poll iteration
#[derive(Debug, Clone, Copy)]
pub struct PollCycle {
    pub window: SchedulingWindow,
    /// Write a heartbeat regardless of `last_seen`; set on the first cycle after start
    pub force_heartbeat: bool,
}

/// A connector that passed the readiness gate
#[derive(Debug, Clone)]
pub struct ReadyConnector {
    pub connector: Connector,
    /// Whether the connector's adapter can run incremental syncs
    pub supports_incremental_sync: bool,
}

/// Everything a connector scheduling task needs; cheap to clone into each task
#[derive(Clone)]
pub struct ConnectorScheduler {
    pub(crate) registry: Arc<dyn ConnectorRegistry>,
    pub(crate) catalog: Arc<SourceCatalog>,
    pub(crate) sources: Arc<HashMap<String, String>>,
    pub(crate) local_connectors: Arc<Vec<LocalConnectorConfig>>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) conflict_backoff: ConflictBackoff,
    pub(crate) shutdown: CancellationToken,
}

impl ConnectorScheduler {
    pub fn new(
        registry: Arc<dyn ConnectorRegistry>,
        catalog: Arc<SourceCatalog>,
        sources: HashMap<String, String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            catalog,
            sources: Arc::new(sources),
            local_connectors: Arc::new(Vec::new()),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            conflict_backoff: ConflictBackoff::default(),
            shutdown,
        }
    }

    pub fn with_local_connectors(mut self, local_connectors: Vec<LocalConnectorConfig>) -> Self {
        self.local_connectors = Arc::new(local_connectors);
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_conflict_backoff(mut self, conflict_backoff: ConflictBackoff) -> Self {
        self.conflict_backoff = conflict_backoff;
        self
    }

    /// False once shutdown has been requested
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Run one connector through the readiness gate and, when it passes, the
    /// sync-type waterfall.
    #[instrument(skip(self, connector, cycle), fields(connector_id = %connector.id))]
    pub async fn run(
        &self,
        connector: Connector,
        cycle: PollCycle,
    ) -> Result<Vec<SyncAttempt>, ConnectorError> {
        let ready = self.ensure_ready(connector, cycle.force_heartbeat).await?;
        Ok(self.schedule_sync_types(&ready, cycle.window).await)
    }

    /// Store `message` as the connector's last error; failures are only logged
    pub(crate) async fn persist_error(&self, connector_id: &str, message: &str) {
        if let Err(e) = self.registry.record_error(connector_id, message).await {
            if !matches!(e, RegistryError::NotFound(_)) {
                warn!(connector_id, error = %e, "Failed to store connector error");
            }
        }
    }
}

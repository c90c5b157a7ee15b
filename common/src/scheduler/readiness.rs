// Connector readiness gate
//
// Sequential checks run before any job is scheduled for a connector. The first
// terminal outcome wins: a skip ends this connector's cycle, a fatal
// data-source misconfiguration is handed back to the poll loop.

use super::connector::{ConnectorScheduler, ReadyConnector};
use crate::errors::{ConnectorError, PrepareError, RegistryError, SkipReason, SourceError};
use crate::models::{Connector, ConnectorStatus};
use crate::sources::{DataSource, SourceFactory};
use chrono::Utc;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Failure while checking a connector against its data source
#[derive(Error, Debug)]
enum SourceCheckError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn skip(reason: SkipReason) -> ConnectorError {
    ConnectorError::Skip(reason)
}

/// Owns an adapter instance for the duration of the source checks.
///
/// `close` is awaited on the normal path. If the owning task is dropped
/// first (cancelled, aborted or panicking), the close is handed to the
/// runtime instead.
struct OpenSource {
    source: Arc<dyn DataSource>,
    closed: bool,
}

impl OpenSource {
    fn new(source: Box<dyn DataSource>) -> Self {
        Self {
            source: Arc::from(source),
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        self.source.close().await;
    }
}

impl Deref for OpenSource {
    type Target = dyn DataSource;

    fn deref(&self) -> &Self::Target {
        self.source.as_ref()
    }
}

impl Drop for OpenSource {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Closing data source after interrupted checks");
                let source = self.source.clone();
                handle.spawn(async move { source.close().await });
            }
            Err(_) => warn!("No runtime available to close data source"),
        }
    }
}

impl ConnectorScheduler {
    pub async fn ensure_ready(
        &self,
        connector: Connector,
        force_heartbeat: bool,
    ) -> Result<ReadyConnector, ConnectorError> {
        if !self.is_running() {
            debug!("Skipping run because service is terminating");
            return Err(skip(SkipReason::ShuttingDown));
        }

        if connector.is_native {
            debug!("Natively supported");
        }

        let connector_id = connector.id.clone();
        let connector = match self.prepare(connector).await {
            Ok(connector) => connector,
            Err(PrepareError::NotFound(_)) => {
                error!("Couldn't find connector");
                return Err(skip(SkipReason::NotFound));
            }
            Err(PrepareError::ServiceTypeNotConfigured(_)) => {
                error!("Service type is not configured");
                return Err(skip(SkipReason::ServiceTypeNotConfigured));
            }
            Err(PrepareError::ServiceTypeNotSupported(service_type)) => {
                debug!(service_type = %service_type, "Can't handle source of this type");
                return Err(skip(SkipReason::ServiceTypeNotSupported(service_type)));
            }
            Err(PrepareError::DataSource(e)) => {
                self.persist_error(&connector_id, &e.to_string()).await;
                error!(error = %e, "Failed to prepare connector");
                return Err(ConnectorError::Fatal(e));
            }
            Err(PrepareError::Registry(e)) => {
                error!(error = %e, "Failed to prepare connector");
                return Err(skip(SkipReason::Registry(e.to_string())));
            }
        };

        self.heartbeat(&connector, force_heartbeat)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write heartbeat");
                skip(SkipReason::Registry(e.to_string()))
            })?;

        debug!(status = %connector.status, "Connector status");

        match connector.status {
            ConnectorStatus::Created => {
                info!("Connector has just been created and cannot sync. Wait for it to be initialised before proceeding.");
                return Err(skip(SkipReason::NotActionable(connector.status)));
            }
            ConnectorStatus::NeedsConfiguration => {
                info!("Connector is not configured yet. Finish connector configuration to make it possible to run a sync.");
                return Err(skip(SkipReason::NotActionable(connector.status)));
            }
            _ => {}
        }

        let Some(service_type) = connector.service_type.clone() else {
            error!("Service type is not configured");
            return Err(skip(SkipReason::ServiceTypeNotConfigured));
        };
        let factory = self.catalog.resolve(&self.sources, &service_type)?;

        self.check_source(&connector, factory).await?;

        Ok(ReadyConnector {
            connector,
            supports_incremental_sync: factory.supports_incremental_sync(),
        })
    }

    /// Fill in the service type and default configuration of a locally
    /// configured connector the first time it is seen.
    pub async fn prepare(&self, connector: Connector) -> Result<Connector, PrepareError> {
        let Some(local) = self
            .local_connectors
            .iter()
            .find(|local| local.connector_id == connector.id)
        else {
            return Ok(connector);
        };

        if connector.service_type.is_some() && !connector.configuration.is_empty() {
            return Ok(connector);
        }

        let service_type = local
            .service_type
            .as_deref()
            .ok_or_else(|| PrepareError::ServiceTypeNotConfigured(connector.id.clone()))?;

        if let Some(existing) = connector.service_type.as_deref() {
            if existing != service_type {
                return Err(PrepareError::ServiceTypeNotSupported(existing.to_string()));
            }
        }
        if !self.sources.contains_key(service_type) {
            return Err(PrepareError::ServiceTypeNotSupported(service_type.to_string()));
        }

        let factory = self.catalog.resolve(&self.sources, service_type)?;

        let current = self.registry.reload(&connector.id).await?;
        let service_type_update = current.service_type.is_none().then_some(service_type);
        let configuration_update = current
            .configuration
            .is_empty()
            .then(|| factory.default_configuration());

        if service_type_update.is_none() && configuration_update.is_none() {
            return Ok(current);
        }

        self.registry
            .update_service_type_and_configuration(
                &connector.id,
                service_type_update,
                configuration_update,
            )
            .await?;

        info!(
            service_type,
            "Populated service type and default configuration for local connector"
        );

        Ok(self.registry.reload(&connector.id).await?)
    }

    /// Write `last_seen` when forced, never seen, or older than the heartbeat interval
    pub async fn heartbeat(&self, connector: &Connector, force: bool) -> Result<(), RegistryError> {
        let now = Utc::now();
        if !connector.needs_heartbeat(self.heartbeat_interval, now, force) {
            return Ok(());
        }

        debug!("Sending heartbeat");
        self.registry.heartbeat(&connector.id, now).await
    }

    /// Validate configuration and reachability through a fresh adapter instance,
    /// then mark the connector connected.
    async fn check_source(
        &self,
        connector: &Connector,
        factory: &SourceFactory,
    ) -> Result<(), ConnectorError> {
        let source = match factory.instantiate(&connector.configuration) {
            Ok(source) => OpenSource::new(source),
            Err(e) => return Err(self.source_failure(connector, e.into()).await),
        };

        let result = tokio::select! {
            result = self.run_source_checks(connector, &*source) => Some(result),
            _ = self.shutdown.cancelled() => None,
        };
        source.close().await;

        match result {
            None => {
                debug!("Source checks interrupted because service is terminating");
                return Err(skip(SkipReason::ShuttingDown));
            }
            Some(Err(e)) => return Err(self.source_failure(connector, e).await),
            Some(Ok(())) => {}
        }

        debug!("Connector is configured correctly and can reach the data source");
        if let Err(e) = self.registry.mark_connected(&connector.id).await {
            error!(error = %e, "Failed to mark connector connected");
            self.persist_error(&connector.id, &e.to_string()).await;
            return Err(skip(SkipReason::Registry(e.to_string())));
        }
        Ok(())
    }

    async fn run_source_checks(
        &self,
        connector: &Connector,
        source: &dyn DataSource,
    ) -> Result<(), SourceCheckError> {
        debug!("Validating configuration");
        source.validate_config_fields()?;
        source.validate_config().await?;

        debug!("Pinging the backend");
        source.ping().await?;

        if connector.features.sync_rules_enabled {
            let validation = source
                .validate_filtering(&connector.filtering.rules)
                .await?;
            self.registry
                .update_filtering_validation(&connector.id, &validation)
                .await?;
        }

        Ok(())
    }

    async fn source_failure(&self, connector: &Connector, e: SourceCheckError) -> ConnectorError {
        error!(error = %e, "Data source check failed");
        self.persist_error(&connector.id, &e.to_string()).await;
        skip(SkipReason::SourceFailure(e.to_string()))
    }
}

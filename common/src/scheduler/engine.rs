// Job scheduling service: the poll loop driving per-connector scheduling tasks

use super::connector::{ConnectorScheduler, PollCycle};
use super::planner::SchedulingWindow;
use super::spurious::SpuriousErrorPolicy;
use crate::concurrency::ConflictBackoff;
use crate::config::{LocalConnectorConfig, Settings};
use crate::errors::{ConnectorError, DataSourceError, SchedulerError, SkipReason};
use crate::models::Connector;
use crate::pool::ConcurrentTasks;
use crate::registry::ConnectorRegistry;
use crate::sources::SourceCatalog;
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the job scheduling service
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between the end of one poll cycle and the start of the next
    pub idling: Duration,
    pub heartbeat_interval: Duration,
    /// `None` means unbounded
    pub max_concurrent_scheduling_tasks: Option<usize>,
    pub native_service_types: Vec<String>,
    pub connectors: Vec<LocalConnectorConfig>,
    /// Service type to adapter name
    pub sources: HashMap<String, String>,
    pub max_errors: usize,
    pub max_errors_span: Duration,
    pub spurious_errors: Vec<String>,
    pub conflict_retries: u32,
    /// How long teardown waits for cancelled tasks to finish
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl SchedulerConfig {
    /// Ids of the locally configured connectors, always eligible for listing
    pub fn connector_ids(&self) -> Vec<String> {
        self.connectors
            .iter()
            .map(|connector| connector.connector_id.clone())
            .collect()
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        let scheduler = &settings.scheduler;
        Self {
            idling: Duration::from_secs(scheduler.idling_seconds),
            heartbeat_interval: Duration::from_secs(scheduler.heartbeat_seconds),
            max_concurrent_scheduling_tasks: scheduler
                .max_concurrent_scheduling_tasks
                .filter(|max| *max > 0),
            native_service_types: settings.native_service_types.clone(),
            connectors: settings.connectors.clone(),
            sources: settings.sources.clone(),
            max_errors: scheduler.max_errors,
            max_errors_span: Duration::from_secs(scheduler.max_errors_span_seconds),
            spurious_errors: scheduler.spurious_errors.clone(),
            conflict_retries: scheduler.conflict_retries,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Scheduler trait for the service lifecycle
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the poll loop until stopped or a non-absorbable error occurs
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Request shutdown; `start` returns once teardown completes
    async fn stop(&self) -> Result<(), SchedulerError>;

    fn state(&self) -> ServiceState;
}

struct Lifecycle {
    state: ServiceState,
    shutdown: CancellationToken,
    pool: Option<Arc<ConcurrentTasks>>,
}

/// Periodically enumerates eligible connectors and fans scheduling work out
/// onto a bounded task pool.
pub struct JobSchedulingService {
    config: SchedulerConfig,
    registry: Arc<dyn ConnectorRegistry>,
    catalog: Arc<SourceCatalog>,
    lifecycle: Mutex<Lifecycle>,
    registry_closed: AtomicBool,
}

impl JobSchedulingService {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn ConnectorRegistry>,
        catalog: Arc<SourceCatalog>,
    ) -> Self {
        Self {
            config,
            registry,
            catalog,
            lifecycle: Mutex::new(Lifecycle {
                state: ServiceState::Stopped,
                shutdown: CancellationToken::new(),
                pool: None,
            }),
            registry_closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `Running` with a fresh cancellation token and task pool
    fn begin(&self) -> Result<(CancellationToken, Arc<ConcurrentTasks>), SchedulerError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != ServiceState::Stopped {
            return Err(SchedulerError::InvalidState(lifecycle.state.to_string()));
        }
        if self.registry_closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::InvalidState(
                "registry already closed".to_string(),
            ));
        }

        let shutdown = CancellationToken::new();
        let pool = Arc::new(ConcurrentTasks::new(
            self.config.max_concurrent_scheduling_tasks,
        ));
        lifecycle.state = ServiceState::Running;
        lifecycle.shutdown = shutdown.clone();
        lifecycle.pool = Some(pool.clone());

        Ok((shutdown, pool))
    }

    fn connector_scheduler(&self, shutdown: CancellationToken) -> ConnectorScheduler {
        ConnectorScheduler::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.config.sources.clone(),
            shutdown,
        )
        .with_local_connectors(self.config.connectors.clone())
        .with_heartbeat_interval(self.config.heartbeat_interval)
        .with_conflict_backoff(ConflictBackoff::new(self.config.conflict_retries))
    }

    async fn run(
        &self,
        shutdown: &CancellationToken,
        pool: &ConcurrentTasks,
    ) -> Result<(), SchedulerError> {
        let scheduler = self.connector_scheduler(shutdown.clone());
        let native_service_types = &self.config.native_service_types;
        let connector_ids = self.config.connector_ids();

        let mut spurious = SpuriousErrorPolicy::new(
            self.config.spurious_errors.clone(),
            self.config.max_errors,
            self.config.max_errors_span,
        );
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<DataSourceError>();
        let mut window = SchedulingWindow::since(Utc::now());
        let mut first_cycle = true;

        while !shutdown.is_cancelled() {
            debug!(
                idling_seconds = self.config.idling.as_secs(),
                "Polling for connectors to schedule"
            );
            let cycle = PollCycle {
                window,
                force_heartbeat: first_cycle,
            };
            first_cycle = false;

            let mut connectors = self
                .registry
                .list_eligible_connectors(native_service_types, &connector_ids);

            while let Some(item) = connectors.next().await {
                if shutdown.is_cancelled() {
                    break;
                }
                match item {
                    Ok(connector) => self.submit(pool, &scheduler, connector, cycle, &errors_tx),
                    Err(e) => {
                        error!(error = %e, "Failed to list connectors");
                        spurious.absorb(e.into())?;
                        break;
                    }
                }
            }
            drop(connectors);

            pool.join().await;
            telemetry::update_running_tasks(pool.running());

            while let Ok(e) = errors_rx.try_recv() {
                error!(error = %e, "Connector scheduling failed");
                spurious.absorb(e.into())?;
            }

            if shutdown.is_cancelled() {
                break;
            }

            window = SchedulingWindow::since(Utc::now());

            tokio::select! {
                _ = sleep(self.config.idling) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    /// Hand one connector to the task pool; a full pool drops it for this cycle
    fn submit(
        &self,
        pool: &ConcurrentTasks,
        scheduler: &ConnectorScheduler,
        connector: Connector,
        cycle: PollCycle,
        errors: &mpsc::UnboundedSender<DataSourceError>,
    ) {
        let connector_id = connector.id.clone();
        let scheduler = scheduler.clone();
        let errors = errors.clone();

        let accepted = pool.try_put(async move {
            match scheduler.run(connector, cycle).await {
                Ok(_) => {}
                Err(ConnectorError::Skip(SkipReason::ShuttingDown)) => {}
                Err(ConnectorError::Skip(reason)) => {
                    telemetry::record_connector_error(reason.label());
                }
                Err(ConnectorError::Fatal(e)) => {
                    telemetry::record_connector_error("data_source");
                    let _ = errors.send(e);
                }
            }
        });

        if accepted {
            telemetry::update_running_tasks(pool.running());
        } else {
            telemetry::record_pool_rejection();
            debug!(
                connector_id = %connector_id,
                max_concurrent_scheduling_tasks = ?pool.max_concurrency(),
                "Job scheduling service is already running the maximum number of concurrent scheduling tasks and can't run more at this point. Increase 'max_concurrent_scheduling_tasks' to run more."
            );
        }
    }

    /// Cancel outstanding work, close the registry once and return to `Stopped`
    async fn teardown(&self, pool: &ConcurrentTasks) {
        pool.cancel();
        if timeout(self.config.shutdown_timeout, pool.join())
            .await
            .is_err()
        {
            warn!(
                timeout_seconds = self.config.shutdown_timeout.as_secs(),
                "Timed out waiting for scheduling tasks to finish"
            );
        }
        telemetry::update_running_tasks(0);

        if !self.registry_closed.swap(true, Ordering::SeqCst) {
            self.registry.close().await;
        }

        let mut lifecycle = self.lifecycle();
        lifecycle.shutdown.cancel();
        lifecycle.pool = None;
        lifecycle.state = ServiceState::Stopped;
    }
}

#[async_trait]
impl Scheduler for JobSchedulingService {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        let (shutdown, pool) = self.begin()?;

        if self.config.native_service_types.is_empty() {
            debug!("No native service types configured for job scheduling");
        } else {
            debug!(
                native_service_types = %self.config.native_service_types.join(", "),
                "Native support for job scheduling"
            );
        }
        info!(
            registry = %self.registry.describe(),
            idling_seconds = self.config.idling.as_secs(),
            max_concurrent_scheduling_tasks = ?self.config.max_concurrent_scheduling_tasks,
            "Job scheduling service started"
        );

        let result = self.run(&shutdown, &pool).await;
        if let Err(e) = &result {
            error!(error = %e, "Job scheduling service is terminating on error");
        }

        self.teardown(&pool).await;
        info!("Job scheduling service stopped");
        result
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != ServiceState::Running {
            debug!(state = %lifecycle.state, "Stop requested while not running");
            return Ok(());
        }

        info!("Stopping job scheduling service");
        lifecycle.state = ServiceState::Stopping;
        lifecycle.shutdown.cancel();
        if let Some(pool) = &lifecycle.pool {
            pool.cancel();
        }
        Ok(())
    }

    fn state(&self) -> ServiceState {
        self.lifecycle().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RegistryError;
    use crate::registry::InMemoryRegistry;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            idling: Duration::from_secs(1),
            native_service_types: vec!["http".to_string()],
            ..SchedulerConfig::default()
        }
    }

    fn service(registry: Arc<InMemoryRegistry>, config: SchedulerConfig) -> Arc<JobSchedulingService> {
        Arc::new(JobSchedulingService::new(
            config,
            registry,
            Arc::new(SourceCatalog::builtin()),
        ))
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.scheduler.max_concurrent_scheduling_tasks = Some(0);
        settings.scheduler.idling_seconds = 7;
        settings.connectors = vec![LocalConnectorConfig {
            connector_id: "local-1".to_string(),
            service_type: Some("http".to_string()),
        }];

        let config = SchedulerConfig::from(&settings);
        assert_eq!(config.connector_ids(), vec!["local-1".to_string()]);
        assert_eq!(config.idling, Duration::from_secs(7));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(config.max_concurrent_scheduling_tasks, None);
        assert_eq!(config.max_errors, 20);
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_sleep_and_closes_registry_once() {
        let registry = Arc::new(InMemoryRegistry::new());
        let service = service(
            registry.clone(),
            SchedulerConfig {
                idling: Duration::from_secs(3600),
                ..config()
            },
        );

        let runner = service.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        while service.state() != ServiceState::Running {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        service.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(registry.close_calls(), 1);

        // The registry is gone; the service cannot be restarted
        assert!(matches!(
            service.start().await,
            Err(SchedulerError::InvalidState(_))
        ));
        assert_eq!(registry.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_listing_errors_exhaust_budget() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.fail_listing(Some(RegistryError::Database("unavailable".to_string())));
        let service = service(
            registry.clone(),
            SchedulerConfig {
                idling: Duration::from_millis(1),
                max_errors: 2,
                ..config()
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(5), service.start())
            .await
            .unwrap();

        assert_eq!(
            result,
            Err(SchedulerError::Registry(RegistryError::Database(
                "unavailable".to_string()
            )))
        );
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(registry.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_listing_errors_terminate_when_not_spurious() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.fail_listing(Some(RegistryError::Database("unavailable".to_string())));
        let service = service(
            registry.clone(),
            SchedulerConfig {
                spurious_errors: Vec::new(),
                ..config()
            },
        );

        let result = service.start().await;
        assert!(matches!(result, Err(SchedulerError::Registry(_))));
        assert_eq!(registry.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let registry = Arc::new(InMemoryRegistry::new());
        let service = service(registry.clone(), config());
        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(registry.close_calls(), 0);
    }
}

// Scheduler binary entry point

use common::bootstrap;
use common::scheduler::{JobSchedulingService, Scheduler, SchedulerConfig};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = bootstrap::load_settings()?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting connector job scheduler");

    let catalog = bootstrap::init_source_catalog(&settings)?;
    let registry = bootstrap::init_registry(&settings).await?;

    let service = Arc::new(JobSchedulingService::new(
        SchedulerConfig::from(&settings),
        registry,
        catalog,
    ));

    let service_for_shutdown = service.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = service_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    let result = service.start().await;
    telemetry::shutdown_tracer();

    if let Err(e) = result {
        error!(error = %e, "Scheduler error");
        return Err(e.into());
    }

    info!("Scheduler stopped");
    Ok(())
}

// Bootstrap utilities for binary initialization

use crate::config::{RegistryBackend, Settings};
use crate::db::DbPool;
use crate::registry::{ConnectorRegistry, InMemoryRegistry, PostgresRegistry};
use crate::sources::SourceCatalog;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Load settings from `config/` and the environment, then validate them
pub fn load_settings() -> Result<Settings> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(settings)
}

/// Build the adapter catalog and check every configured source resolves
#[tracing::instrument(skip(settings))]
pub fn init_source_catalog(settings: &Settings) -> Result<Arc<SourceCatalog>> {
    let catalog = SourceCatalog::builtin();
    settings
        .validate_sources(&catalog)
        .map_err(|e| anyhow::anyhow!("Invalid sources configuration: {}", e))?;

    let mut service_types: Vec<&String> = settings.sources.keys().collect();
    service_types.sort();
    info!(service_types = ?service_types, "Source catalog initialized");
    Ok(Arc::new(catalog))
}

/// Initialize database pool
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.registry)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Connect to the configured registry backend
#[tracing::instrument(skip(settings))]
pub async fn init_registry(settings: &Settings) -> Result<Arc<dyn ConnectorRegistry>> {
    match settings.registry.backend {
        RegistryBackend::Postgres => {
            let db_pool = init_database_pool(settings).await?;
            db_pool
                .health_check()
                .await
                .context("Registry health check failed")?;

            let registry = PostgresRegistry::new(db_pool);
            registry
                .ensure_schema()
                .await
                .context("Failed to prepare registry schema")?;
            Ok(Arc::new(registry))
        }
        RegistryBackend::Memory => {
            warn!("Using the in-memory registry; state is not shared between processes");
            Ok(Arc::new(InMemoryRegistry::new()))
        }
    }
}

// PostgreSQL data source adapter

use super::{filtering, optional_u64, required_str, DataSource, SourceFactory};
use crate::errors::SourceError;
use crate::models::{Configuration, FilteringRule, FilteringValidation};
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const ADAPTER_NAME: &str = "postgresql";

const DEFAULT_PORT: u64 = 5432;
const CONNECT_TIMEOUT_SECONDS: u64 = 10;

pub fn factory() -> SourceFactory {
    let mut defaults = Configuration::new();
    defaults.insert("host".to_string(), json!(""));
    defaults.insert("port".to_string(), json!(DEFAULT_PORT));
    defaults.insert("username".to_string(), json!(""));
    defaults.insert("password".to_string(), json!(""));
    defaults.insert("database".to_string(), json!(""));
    defaults.insert("tables".to_string(), json!("*"));

    SourceFactory::new(ADAPTER_NAME, |configuration| {
        Ok(Box::new(PostgresDataSource::new(configuration.clone())) as Box<dyn DataSource>)
    })
    .with_default_configuration(defaults)
}

/// PostgresDataSource checks connectivity with a single short-lived connection
pub struct PostgresDataSource {
    configuration: Configuration,
    pool: Mutex<Option<PgPool>>,
}

impl PostgresDataSource {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            pool: Mutex::new(None),
        }
    }

    fn connect_options(&self) -> Result<PgConnectOptions, SourceError> {
        let port = optional_u64(&self.configuration, "port")?.unwrap_or(DEFAULT_PORT);
        let port = u16::try_from(port).map_err(|_| SourceError::InvalidFieldValue {
            field: "port".to_string(),
            reason: format!("{} is out of range", port),
        })?;

        Ok(PgConnectOptions::new()
            .host(required_str(&self.configuration, "host")?)
            .port(port)
            .username(required_str(&self.configuration, "username")?)
            .password(required_str(&self.configuration, "password").unwrap_or_default())
            .database(required_str(&self.configuration, "database")?))
    }

    async fn pool(&self) -> Result<PgPool, SourceError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .connect_with(self.connect_options()?)
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        *guard = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl DataSource for PostgresDataSource {
    fn validate_config_fields(&self) -> Result<(), SourceError> {
        for field in ["host", "username", "database"] {
            required_str(&self.configuration, field)?;
        }
        optional_u64(&self.configuration, "port")?;
        Ok(())
    }

    async fn validate_config(&self) -> Result<(), SourceError> {
        self.connect_options().map(|_| ())
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), SourceError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        debug!("PostgreSQL data source is reachable");
        Ok(())
    }

    async fn validate_filtering(
        &self,
        rules: &[FilteringRule],
    ) -> Result<FilteringValidation, SourceError> {
        Ok(filtering::validate_basic_rules(rules))
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

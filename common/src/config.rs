// Configuration management with layered configuration (file, env)

use crate::concurrency::DEFAULT_CONFLICT_RETRIES;
use crate::sources::SourceCatalog;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Service type to adapter name
    #[serde(default)]
    pub sources: HashMap<String, String>,
    /// Service types handled for every native connector in the registry
    #[serde(default)]
    pub native_service_types: Vec<String>,
    /// Connectors this deployment is responsible for in addition to native ones
    #[serde(default)]
    pub connectors: Vec<LocalConnectorConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Postgres,
            url: "postgresql://localhost/connectors".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between poll cycles
    pub idling_seconds: u64,
    /// Minimum gap between connector heartbeats
    pub heartbeat_seconds: u64,
    /// Ceiling on in-flight connector tasks; absent or 0 means unbounded
    pub max_concurrent_scheduling_tasks: Option<usize>,
    /// Error budget for spurious errors
    pub max_errors: usize,
    pub max_errors_span_seconds: u64,
    /// Error kinds absorbed by the budget ("registry", "data_source")
    pub spurious_errors: Vec<String>,
    /// Re-runs of a scheduling attempt after a version conflict
    pub conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idling_seconds: 30,
            heartbeat_seconds: 300,
            max_concurrent_scheduling_tasks: None,
            max_errors: 20,
            max_errors_span_seconds: 600,
            spurious_errors: vec!["registry".to_string(), "data_source".to_string()],
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

/// Locally configured connector, filled in on first sight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConnectorConfig {
    pub connector_id: String,
    #[serde(default)]
    pub service_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.registry.backend, RegistryBackend::Postgres) {
            if self.registry.url.is_empty() {
                return Err("Registry URL cannot be empty".to_string());
            }
            if self.registry.max_connections == 0 {
                return Err("Registry max_connections must be greater than 0".to_string());
            }
        }

        if self.scheduler.idling_seconds == 0 {
            return Err("Scheduler idling_seconds must be greater than 0".to_string());
        }
        if self.scheduler.heartbeat_seconds == 0 {
            return Err("Scheduler heartbeat_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_errors_span_seconds == 0 {
            return Err("Scheduler max_errors_span_seconds must be greater than 0".to_string());
        }

        for kind in &self.scheduler.spurious_errors {
            if !matches!(kind.as_str(), "registry" | "data_source") {
                return Err(format!("Unknown spurious error kind '{}'", kind));
            }
        }

        for connector in &self.connectors {
            if connector.connector_id.trim().is_empty() {
                return Err("Local connector_id cannot be empty".to_string());
            }
        }

        if self.native_service_types.is_empty() && self.connectors.is_empty() {
            return Err(
                "Either native_service_types or connectors must be configured".to_string(),
            );
        }

        Ok(())
    }

    /// Check every configured source maps to an adapter in `catalog`
    pub fn validate_sources(&self, catalog: &SourceCatalog) -> Result<(), String> {
        catalog
            .validate_sources(&self.sources)
            .map_err(|e| e.to_string())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            sources: HashMap::from([
                ("http".to_string(), "http".to_string()),
                ("postgresql".to_string(), "postgresql".to_string()),
            ]),
            native_service_types: vec!["http".to_string(), "postgresql".to_string()],
            connectors: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

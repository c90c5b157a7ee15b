// Data source adapters and the service-type → adapter factory catalog

pub mod filtering;
pub mod http;
pub mod postgresql;

use crate::errors::{DataSourceError, SourceError};
use crate::models::{Configuration, FilteringRule, FilteringValidation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use http::HttpDataSource;
pub use postgresql::PostgresDataSource;

/// A connection to a third-party system that a connector synchronizes from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Static check that the required fields are present and well-formed
    fn validate_config_fields(&self) -> Result<(), SourceError>;

    /// Deeper validation of configuration values; may reach the backend
    async fn validate_config(&self) -> Result<(), SourceError>;

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<(), SourceError>;

    /// Validate draft filtering rules against what this adapter supports
    async fn validate_filtering(
        &self,
        rules: &[FilteringRule],
    ) -> Result<FilteringValidation, SourceError>;

    /// Release any resources held by the adapter
    async fn close(&self);
}

type Constructor =
    Arc<dyn Fn(&Configuration) -> Result<Box<dyn DataSource>, SourceError> + Send + Sync>;

/// Builds adapter instances for one adapter name
#[derive(Clone)]
pub struct SourceFactory {
    name: String,
    supports_incremental_sync: bool,
    default_configuration: Configuration,
    constructor: Constructor,
}

impl SourceFactory {
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Configuration) -> Result<Box<dyn DataSource>, SourceError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            supports_incremental_sync: false,
            default_configuration: Configuration::new(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn with_incremental_sync(mut self, supported: bool) -> Self {
        self.supports_incremental_sync = supported;
        self
    }

    pub fn with_default_configuration(mut self, configuration: Configuration) -> Self {
        self.default_configuration = configuration;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_incremental_sync(&self) -> bool {
        self.supports_incremental_sync
    }

    /// Configuration written onto connectors that have none yet
    pub fn default_configuration(&self) -> &Configuration {
        &self.default_configuration
    }

    pub fn instantiate(
        &self,
        configuration: &Configuration,
    ) -> Result<Box<dyn DataSource>, SourceError> {
        (self.constructor)(configuration)
    }
}

impl fmt::Debug for SourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFactory")
            .field("name", &self.name)
            .field("supports_incremental_sync", &self.supports_incremental_sync)
            .finish()
    }
}

/// Lookup table of adapter factories by adapter name
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    factories: HashMap<String, SourceFactory>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the adapters shipped in this crate
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(http::factory());
        catalog.register(postgresql::factory());
        catalog
    }

    pub fn register(&mut self, factory: SourceFactory) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn get(&self, adapter: &str) -> Option<&SourceFactory> {
        self.factories.get(adapter)
    }

    /// Resolve the factory for `service_type` through the configured `sources` mapping
    pub fn resolve(
        &self,
        sources: &HashMap<String, String>,
        service_type: &str,
    ) -> Result<&SourceFactory, DataSourceError> {
        let adapter = sources
            .get(service_type)
            .ok_or_else(|| DataSourceError::UnknownServiceType(service_type.to_string()))?;

        self.get(adapter)
            .ok_or_else(|| DataSourceError::UnknownAdapter {
                service_type: service_type.to_string(),
                adapter: adapter.clone(),
            })
    }

    /// Check every configured service type maps to a registered adapter
    pub fn validate_sources(&self, sources: &HashMap<String, String>) -> Result<(), DataSourceError> {
        let mut service_types: Vec<&String> = sources.keys().collect();
        service_types.sort();
        for service_type in service_types {
            self.resolve(sources, service_type)?;
        }
        Ok(())
    }
}

/// Read a required string field from a connector configuration
pub(crate) fn required_str<'a>(
    configuration: &'a Configuration,
    field: &str,
) -> Result<&'a str, SourceError> {
    match configuration.get(field) {
        None | Some(serde_json::Value::Null) => Err(SourceError::MissingField(field.to_string())),
        Some(serde_json::Value::String(value)) if value.trim().is_empty() => {
            Err(SourceError::MissingField(field.to_string()))
        }
        Some(serde_json::Value::String(value)) => Ok(value),
        Some(_) => Err(SourceError::InvalidFieldValue {
            field: field.to_string(),
            reason: "expected a string".to_string(),
        }),
    }
}

/// Read an optional unsigned integer field, accepting numbers or numeric strings
pub(crate) fn optional_u64(
    configuration: &Configuration,
    field: &str,
) -> Result<Option<u64>, SourceError> {
    let invalid = || SourceError::InvalidFieldValue {
        field: field.to_string(),
        reason: "expected a positive integer".to_string(),
    };

    match configuration.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(invalid),
        Some(serde_json::Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builtin_catalog_resolves_configured_types() {
        let catalog = SourceCatalog::builtin();
        let sources = sources(&[("website", "http"), ("pg", "postgresql")]);

        assert_eq!(catalog.resolve(&sources, "website").unwrap().name(), "http");
        assert_eq!(catalog.resolve(&sources, "pg").unwrap().name(), "postgresql");
        assert!(catalog.validate_sources(&sources).is_ok());
    }

    #[test]
    fn test_resolve_unknown_service_type() {
        let catalog = SourceCatalog::builtin();
        let err = catalog.resolve(&HashMap::new(), "jira").unwrap_err();
        assert_eq!(err, DataSourceError::UnknownServiceType("jira".to_string()));
    }

    #[test]
    fn test_resolve_unknown_adapter() {
        let catalog = SourceCatalog::builtin();
        let sources = sources(&[("jira", "jira-cloud")]);
        assert!(matches!(
            catalog.validate_sources(&sources),
            Err(DataSourceError::UnknownAdapter { .. })
        ));
    }

    #[test]
    fn test_factory_flags() {
        let factory = SourceFactory::new("scripted", |_| Err(SourceError::MissingField("x".into())))
            .with_incremental_sync(true);
        assert!(factory.supports_incremental_sync());
        assert!(factory.default_configuration().is_empty());
        assert!(factory.instantiate(&Configuration::new()).is_err());
    }

    #[test]
    fn test_config_field_helpers() {
        let mut configuration = Configuration::new();
        configuration.insert("host".to_string(), json!("db.internal"));
        configuration.insert("blank".to_string(), json!("  "));
        configuration.insert("port".to_string(), json!("5432"));
        configuration.insert("timeout".to_string(), json!(-1));

        assert_eq!(required_str(&configuration, "host"), Ok("db.internal"));
        assert!(required_str(&configuration, "blank").is_err());
        assert!(required_str(&configuration, "missing").is_err());
        assert_eq!(optional_u64(&configuration, "port"), Ok(Some(5432)));
        assert_eq!(optional_u64(&configuration, "missing"), Ok(None));
        assert!(optional_u64(&configuration, "timeout").is_err());
    }
}

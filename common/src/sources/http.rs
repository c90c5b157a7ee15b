// HTTP data source adapter
//
// Syncs from a JSON-over-HTTP endpoint. Reachability is a GET against the
// configured base URL; any 2xx response counts.

use super::{filtering, optional_u64, required_str, DataSource, SourceFactory};
use crate::errors::SourceError;
use crate::models::{Configuration, FilteringRule, FilteringValidation};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const ADAPTER_NAME: &str = "http";

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Factory registered in the builtin catalog
pub fn factory() -> SourceFactory {
    let mut defaults = Configuration::new();
    defaults.insert("base_url".to_string(), json!(""));
    defaults.insert("timeout_seconds".to_string(), json!(DEFAULT_TIMEOUT_SECONDS));

    SourceFactory::new(ADAPTER_NAME, |configuration| {
        HttpDataSource::new(configuration.clone()).map(|source| Box::new(source) as Box<dyn DataSource>)
    })
    .with_default_configuration(defaults)
}

/// HttpDataSource pings and validates an HTTP endpoint
pub struct HttpDataSource {
    client: Client,
    configuration: Configuration,
}

impl HttpDataSource {
    pub fn new(configuration: Configuration) -> Result<Self, SourceError> {
        let timeout_seconds =
            optional_u64(&configuration, "timeout_seconds")?.unwrap_or(DEFAULT_TIMEOUT_SECONDS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| SourceError::InvalidFieldValue {
                field: "timeout_seconds".to_string(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            configuration,
        })
    }

    fn base_url(&self) -> Result<Url, SourceError> {
        let raw = required_str(&self.configuration, "base_url")?;
        let url = Url::parse(raw).map_err(|e| SourceError::InvalidFieldValue {
            field: "base_url".to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SourceError::InvalidFieldValue {
                field: "base_url".to_string(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    /// Apply bearer or basic authentication when configured
    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Ok(token) = required_str(&self.configuration, "bearer_token") {
            return request.bearer_auth(token);
        }
        if let Ok(username) = required_str(&self.configuration, "username") {
            let password = required_str(&self.configuration, "password").ok();
            return request.basic_auth(username, password);
        }
        request
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    fn validate_config_fields(&self) -> Result<(), SourceError> {
        required_str(&self.configuration, "base_url")?;
        if self.configuration.contains_key("password") {
            required_str(&self.configuration, "username")?;
        }
        Ok(())
    }

    async fn validate_config(&self) -> Result<(), SourceError> {
        self.base_url().map(|_| ())
    }

    #[tracing::instrument(skip(self))]
    async fn ping(&self) -> Result<(), SourceError> {
        let url = self.base_url()?;
        let response = self
            .apply_auth(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unreachable(format!(
                "{} responded with status {}",
                url, status
            )));
        }

        debug!(url = %url, status = %status, "HTTP data source is reachable");
        Ok(())
    }

    async fn validate_filtering(
        &self,
        rules: &[FilteringRule],
    ) -> Result<FilteringValidation, SourceError> {
        Ok(filtering::validate_basic_rules(rules))
    }

    async fn close(&self) {}
}

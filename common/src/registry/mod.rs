// Connector registry: the shared store of connectors, sync jobs and license state
//
// The registry is the only synchronization point between scheduler instances;
// `update_last_sync_scheduled_at` is a conditional write keyed on the
// connector's version.

pub mod memory;
pub mod postgres;

use crate::errors::RegistryError;
use crate::models::{
    Configuration, Connector, FilteringValidation, JobTriggerMethod, JobType, License, SyncJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub use memory::InMemoryRegistry;
pub use postgres::PostgresRegistry;

#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    /// Human readable description of the backing store, for logs
    fn describe(&self) -> String;

    /// Connectors that are native with one of `native_service_types`, or whose
    /// id is in `connector_ids`
    fn list_eligible_connectors<'a>(
        &'a self,
        native_service_types: &'a [String],
        connector_ids: &'a [String],
    ) -> BoxStream<'a, Result<Connector, RegistryError>>;

    /// Fetch the latest state of a connector
    async fn reload(&self, connector_id: &str) -> Result<Connector, RegistryError>;

    /// Set the last-scheduled-at timestamp for `job_type` if the connector is
    /// still at `expected_version`; otherwise fail with `RegistryError::Conflict`
    async fn update_last_sync_scheduled_at(
        &self,
        connector_id: &str,
        job_type: JobType,
        expected_version: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    async fn create_job(
        &self,
        connector_id: &str,
        job_type: JobType,
        trigger_method: JobTriggerMethod,
    ) -> Result<SyncJob, RegistryError>;

    async fn license(&self) -> Result<License, RegistryError>;

    async fn heartbeat(&self, connector_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError>;

    /// Set status `connected` and clear the last error
    async fn mark_connected(&self, connector_id: &str) -> Result<(), RegistryError>;

    /// Set status `error` with `message`
    async fn record_error(&self, connector_id: &str, message: &str) -> Result<(), RegistryError>;

    /// Fill in a service type and/or configuration during connector preparation
    async fn update_service_type_and_configuration(
        &self,
        connector_id: &str,
        service_type: Option<&str>,
        configuration: Option<&Configuration>,
    ) -> Result<(), RegistryError>;

    async fn update_filtering_validation(
        &self,
        connector_id: &str,
        validation: &FilteringValidation,
    ) -> Result<(), RegistryError>;

    /// Release client handles
    async fn close(&self);
}

/// Eligibility rule shared by the backends
pub(crate) fn is_eligible(
    connector: &Connector,
    native_service_types: &[String],
    connector_ids: &[String],
) -> bool {
    let native_match = connector.is_native
        && connector
            .service_type
            .as_ref()
            .is_some_and(|service_type| native_service_types.contains(service_type));

    native_match || connector_ids.contains(&connector.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        let native_types = vec!["http".to_string()];
        let ids = vec!["listed".to_string()];

        let mut native = Connector::new("n1", Some("http"));
        native.is_native = true;
        assert!(is_eligible(&native, &native_types, &ids));

        let mut other_native = Connector::new("n2", Some("postgresql"));
        other_native.is_native = true;
        assert!(!is_eligible(&other_native, &native_types, &ids));

        let not_native = Connector::new("n3", Some("http"));
        assert!(!is_eligible(&not_native, &native_types, &ids));

        let listed = Connector::new("listed", None);
        assert!(is_eligible(&listed, &native_types, &ids));
        assert!(!is_eligible(&listed, &native_types, &[]));
    }
}

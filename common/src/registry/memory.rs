// In-process registry backend
//
// Holds connectors and jobs behind a mutex with the same conditional-write
// semantics as the database backend. Used for local runs and tests; several
// scheduler instances can share one instance to exercise races.

use super::{is_eligible, ConnectorRegistry};
use crate::errors::RegistryError;
use crate::models::{
    Configuration, Connector, ConnectorStatus, FilteringValidation, JobTriggerMethod, JobType,
    License, SyncJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

struct State {
    connectors: BTreeMap<String, Connector>,
    jobs: Vec<SyncJob>,
    license: License,
    list_failure: Option<RegistryError>,
    connect_failure: Option<RegistryError>,
    closed: bool,
}

pub struct InMemoryRegistry {
    state: Mutex<State>,
    close_calls: AtomicUsize,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                connectors: BTreeMap::new(),
                jobs: Vec::new(),
                license: License::Basic,
                list_failure: None,
                connect_failure: None,
                closed: false,
            }),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_license(self, license: License) -> Self {
        self.lock().license = license;
        self
    }

    /// Insert or replace a connector record
    pub fn insert(&self, connector: Connector) {
        self.lock()
            .connectors
            .insert(connector.id.clone(), connector);
    }

    pub fn connector(&self, connector_id: &str) -> Option<Connector> {
        self.lock().connectors.get(connector_id).cloned()
    }

    pub fn set_license(&self, license: License) {
        self.lock().license = license;
    }

    /// Make subsequent connector listings fail with `error`
    pub fn fail_listing(&self, error: Option<RegistryError>) {
        self.lock().list_failure = error;
    }

    /// Make `mark_connected` return `error` until cleared
    pub fn fail_mark_connected(&self, error: Option<RegistryError>) {
        self.lock().connect_failure = error;
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.lock().jobs.clone()
    }

    pub fn jobs_for(&self, connector_id: &str, job_type: JobType) -> Vec<SyncJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|job| job.connector_id == connector_id && job.job_type == job_type)
            .cloned()
            .collect()
    }

    /// How many times `close` has been called
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `change` to an open registry's connector and bump its version
    fn update<F>(&self, connector_id: &str, change: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Connector),
    {
        let mut state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        let connector = state
            .connectors
            .get_mut(connector_id)
            .ok_or_else(|| RegistryError::NotFound(connector_id.to_string()))?;
        change(connector);
        connector.version += 1;
        Ok(())
    }
}

#[async_trait]
impl ConnectorRegistry for InMemoryRegistry {
    fn describe(&self) -> String {
        "in-memory registry".to_string()
    }

    fn list_eligible_connectors<'a>(
        &'a self,
        native_service_types: &'a [String],
        connector_ids: &'a [String],
    ) -> BoxStream<'a, Result<Connector, RegistryError>> {
        let state = self.lock();
        let items: Vec<Result<Connector, RegistryError>> = if state.closed {
            vec![Err(RegistryError::Closed)]
        } else if let Some(error) = state.list_failure.clone() {
            vec![Err(error)]
        } else {
            state
                .connectors
                .values()
                .filter(|c| is_eligible(c, native_service_types, connector_ids))
                .cloned()
                .map(Ok)
                .collect()
        };

        stream::iter(items).boxed()
    }

    async fn reload(&self, connector_id: &str) -> Result<Connector, RegistryError> {
        let state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        state
            .connectors
            .get(connector_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(connector_id.to_string()))
    }

    async fn update_last_sync_scheduled_at(
        &self,
        connector_id: &str,
        job_type: JobType,
        expected_version: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        let connector = state
            .connectors
            .get_mut(connector_id)
            .ok_or_else(|| RegistryError::NotFound(connector_id.to_string()))?;

        if connector.version != expected_version {
            debug!(
                connector_id,
                expected_version,
                actual_version = connector.version,
                "Conditional update lost the race"
            );
            return Err(RegistryError::Conflict {
                connector_id: connector_id.to_string(),
                expected: expected_version,
            });
        }

        connector.last_sync_scheduled_at.set(job_type, scheduled_at);
        connector.version += 1;
        Ok(())
    }

    async fn create_job(
        &self,
        connector_id: &str,
        job_type: JobType,
        trigger_method: JobTriggerMethod,
    ) -> Result<SyncJob, RegistryError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if !state.connectors.contains_key(connector_id) {
            return Err(RegistryError::NotFound(connector_id.to_string()));
        }
        let job = SyncJob::new(connector_id, job_type, trigger_method);
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn license(&self) -> Result<License, RegistryError> {
        let state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        Ok(state.license)
    }

    async fn heartbeat(&self, connector_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        self.update(connector_id, |connector| connector.last_seen = Some(at))
    }

    async fn mark_connected(&self, connector_id: &str) -> Result<(), RegistryError> {
        if let Some(error) = self.lock().connect_failure.clone() {
            return Err(error);
        }
        self.update(connector_id, |connector| {
            connector.status = ConnectorStatus::Connected;
            connector.error = None;
        })
    }

    async fn record_error(&self, connector_id: &str, message: &str) -> Result<(), RegistryError> {
        self.update(connector_id, |connector| {
            connector.status = ConnectorStatus::Error;
            connector.error = Some(message.to_string());
        })
    }

    async fn update_service_type_and_configuration(
        &self,
        connector_id: &str,
        service_type: Option<&str>,
        configuration: Option<&Configuration>,
    ) -> Result<(), RegistryError> {
        self.update(connector_id, |connector| {
            if let Some(service_type) = service_type {
                connector.service_type = Some(service_type.to_string());
            }
            if let Some(configuration) = configuration {
                connector.configuration = configuration.clone();
            }
        })
    }

    async fn update_filtering_validation(
        &self,
        connector_id: &str,
        validation: &FilteringValidation,
    ) -> Result<(), RegistryError> {
        self.update(connector_id, |connector| {
            connector.filtering.validation = Some(validation.clone());
        })
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().closed = true;
    }
}

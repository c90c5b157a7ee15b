// Property-based tests for connector scheduling
// Duplicate prevention across instances, due/not-due decisions, the sync-type
// waterfall and shutdown behaviour, against the in-memory registry.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use common::errors::{RegistryError, SourceError};
use common::models::{
    Configuration, Connector, ConnectorStatus, FilteringRule, FilteringValidation,
    JobTriggerMethod, JobType, License, SyncJob, SyncSchedule,
};
use common::registry::{ConnectorRegistry, InMemoryRegistry};
use common::scheduler::{
    should_schedule, ConnectorScheduler, Decision, PollCycle, SchedulingWindow, SyncOutcome,
};
use common::sources::{DataSource, SourceCatalog, SourceFactory};
use futures::stream::BoxStream;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Data source that accepts any configuration and is always reachable
struct ScriptedSource;

#[async_trait]
impl DataSource for ScriptedSource {
    fn validate_config_fields(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn validate_config(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn validate_filtering(
        &self,
        _rules: &[FilteringRule],
    ) -> Result<FilteringValidation, SourceError> {
        Ok(FilteringValidation::valid())
    }

    async fn close(&self) {}
}

fn catalog(supports_incremental_sync: bool) -> Arc<SourceCatalog> {
    let mut catalog = SourceCatalog::new();
    catalog.register(
        SourceFactory::new("scripted", |_| Ok(Box::new(ScriptedSource) as Box<dyn DataSource>))
            .with_incremental_sync(supports_incremental_sync),
    );
    Arc::new(catalog)
}

fn sources() -> HashMap<String, String> {
    HashMap::from([("scripted".to_string(), "scripted".to_string())])
}

fn scheduler(
    registry: Arc<dyn ConnectorRegistry>,
    supports_incremental_sync: bool,
) -> ConnectorScheduler {
    ConnectorScheduler::new(
        registry,
        catalog(supports_incremental_sync),
        sources(),
        CancellationToken::new(),
    )
}

/// Connected connector with a full sync every second
fn connector(id: &str) -> Connector {
    let mut connector = Connector::new(id, Some("scripted"));
    connector.status = ConnectorStatus::Connected;
    connector.is_native = true;
    connector
        .configuration
        .insert("base_url".to_string(), json!("https://example.com"));
    connector
        .scheduling
        .set(JobType::Full, SyncSchedule::every("* * * * * *"));
    connector
}

fn recent_window() -> SchedulingWindow {
    SchedulingWindow::since(Utc::now() - ChronoDuration::seconds(5))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// *For any* number of scheduler instances evaluating the same due connector in
/// the same window, exactly one job is created.
#[test]
fn property_racing_instances_create_exactly_one_job() {
    let config = ProptestConfig {
        cases: 16,
        ..ProptestConfig::default()
    };

    proptest!(config, |(instances in 2usize..8usize)| {
        let rt = runtime();
        let (scheduled, jobs) = rt.block_on(async {
            let registry = Arc::new(InMemoryRegistry::new());
            registry.insert(connector("c1"));
            let window = recent_window();

            let mut handles = Vec::new();
            for _ in 0..instances {
                let instance = scheduler(registry.clone(), false);
                handles.push(tokio::spawn(async move {
                    instance.try_schedule_sync("c1", JobType::Full, window).await
                }));
            }

            let mut scheduled = 0;
            for handle in handles {
                if handle.await.unwrap().unwrap().is_some() {
                    scheduled += 1;
                }
            }
            (scheduled, registry.jobs())
        });

        prop_assert_eq!(scheduled, 1);
        prop_assert_eq!(jobs.len(), 1);
        prop_assert_eq!(jobs[0].trigger_method, JobTriggerMethod::Scheduled);
    });
}

/// *For any* last wake-up time and evaluation instant, a per-minute policy is
/// due exactly when the first minute boundary after the wake-up has passed.
#[test]
fn property_due_iff_next_sync_has_passed() {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    proptest!(|(
        wake_offset in 0i64..3600i64,
        elapsed in 0i64..180i64
    )| {
        let mut connector = connector("c1");
        connector.scheduling.set(JobType::Full, SyncSchedule::every("0 * * * * *"));

        let last_wake_up_time = base + ChronoDuration::seconds(wake_offset);
        let now = last_wake_up_time + ChronoDuration::seconds(elapsed);
        let next_sync = base + ChronoDuration::seconds((wake_offset / 60 + 1) * 60);

        let decision = should_schedule(
            &connector,
            JobType::Full,
            SchedulingWindow::since(last_wake_up_time),
            now,
        )
        .unwrap();

        if now >= next_sync {
            prop_assert_eq!(decision, Decision::Due(next_sync));
        } else {
            prop_assert_eq!(decision, Decision::NotDue(next_sync));
        }
    });
}

/// *For any* claim recorded after the window started, the job type is left to
/// the instance that made it.
#[test]
fn property_claims_inside_window_are_respected() {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    proptest!(|(claim_offset in 1i64..600i64, elapsed in 0i64..600i64)| {
        let mut connector = connector("c1");
        connector
            .last_sync_scheduled_at
            .set(JobType::Full, base + ChronoDuration::seconds(claim_offset));

        let decision = should_schedule(
            &connector,
            JobType::Full,
            SchedulingWindow::since(base),
            base + ChronoDuration::seconds(elapsed),
        )
        .unwrap();

        prop_assert!(matches!(decision, Decision::ScheduledElsewhere(_)));
    });
}

#[tokio::test]
async fn test_retry_within_same_window_is_idempotent() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.insert(connector("c1"));
    let scheduler = scheduler(registry.clone(), false);
    let window = recent_window();

    let first = scheduler
        .try_schedule_sync("c1", JobType::Full, window)
        .await
        .unwrap();
    let second = scheduler
        .try_schedule_sync("c1", JobType::Full, window)
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(registry.jobs().len(), 1);
    assert!(registry
        .connector("c1")
        .unwrap()
        .last_sync_scheduled_at
        .full
        .is_some());
}

#[tokio::test]
async fn test_disabled_policy_never_schedules() {
    let registry = Arc::new(InMemoryRegistry::new());
    let mut disabled = connector("disabled");
    disabled
        .scheduling
        .set(JobType::Full, SyncSchedule::disabled());
    registry.insert(disabled);
    let mut no_policy = connector("no-policy");
    no_policy.scheduling = Default::default();
    registry.insert(no_policy);

    let scheduler = scheduler(registry.clone(), false);
    let window = SchedulingWindow::since(Utc::now() - ChronoDuration::days(30));

    for id in ["disabled", "no-policy"] {
        let job = scheduler
            .try_schedule_sync(id, JobType::Full, window)
            .await
            .unwrap();
        assert!(job.is_none());
    }
    assert!(registry.jobs().is_empty());
}

#[tokio::test]
async fn test_invalid_policy_is_recorded_on_connector() {
    let registry = Arc::new(InMemoryRegistry::new());
    let mut broken = connector("broken");
    broken
        .scheduling
        .set(JobType::Full, SyncSchedule::every("every tuesday"));
    registry.insert(broken);

    let job = scheduler(registry.clone(), false)
        .try_schedule_sync("broken", JobType::Full, recent_window())
        .await
        .unwrap();

    assert!(job.is_none());
    let stored = registry.connector("broken").unwrap();
    assert_eq!(stored.status, ConnectorStatus::Error);
    assert!(stored.error.unwrap().contains("every tuesday"));
}

#[tokio::test]
async fn test_missing_connector_is_not_scheduled() {
    let registry = Arc::new(InMemoryRegistry::new());
    let job = scheduler(registry.clone(), false)
        .try_schedule_sync("ghost", JobType::Full, recent_window())
        .await
        .unwrap();
    assert!(job.is_none());
}

fn waterfall_connector() -> Connector {
    let mut connector = connector("c1");
    connector.features.document_level_security_enabled = true;
    connector.features.incremental_sync_enabled = true;
    connector
        .scheduling
        .set(JobType::Incremental, SyncSchedule::every("* * * * * *"));
    connector
        .scheduling
        .set(JobType::AccessControl, SyncSchedule::every("* * * * * *"));
    connector
}

fn cycle() -> PollCycle {
    PollCycle {
        window: recent_window(),
        force_heartbeat: false,
    }
}

#[tokio::test]
async fn test_waterfall_order() {
    let registry = Arc::new(InMemoryRegistry::new().with_license(License::Platinum));
    registry.insert(waterfall_connector());

    let attempts = scheduler(registry.clone(), true)
        .run(waterfall_connector(), cycle())
        .await
        .unwrap();

    let job_types: Vec<JobType> = attempts.iter().map(|a| a.job_type).collect();
    assert_eq!(
        job_types,
        vec![JobType::AccessControl, JobType::Incremental, JobType::Full]
    );
    assert!(attempts
        .iter()
        .all(|a| matches!(a.outcome, SyncOutcome::Scheduled(_))));

    let created: Vec<JobType> = registry.jobs().iter().map(|job| job.job_type).collect();
    assert_eq!(created, job_types);
}

#[tokio::test]
async fn test_incremental_and_full_without_document_level_security() {
    let registry = Arc::new(InMemoryRegistry::new());
    let mut connector = waterfall_connector();
    connector.features.document_level_security_enabled = false;
    registry.insert(connector.clone());

    let attempts = scheduler(registry.clone(), true)
        .run(connector, cycle())
        .await
        .unwrap();

    let job_types: Vec<JobType> = attempts.iter().map(|a| a.job_type).collect();
    assert_eq!(job_types, vec![JobType::Incremental, JobType::Full]);
    assert!(attempts
        .iter()
        .all(|a| matches!(a.outcome, SyncOutcome::Scheduled(_))));

    let jobs = registry.jobs();
    let created: Vec<JobType> = jobs.iter().map(|job| job.job_type).collect();
    assert_eq!(created, vec![JobType::Incremental, JobType::Full]);
    assert!(jobs.iter().all(|job| {
        job.connector_id == "c1" && job.trigger_method == JobTriggerMethod::Scheduled
    }));
    assert!(registry.jobs_for("c1", JobType::AccessControl).is_empty());
}

#[tokio::test]
async fn test_incremental_requires_adapter_support() {
    let registry = Arc::new(InMemoryRegistry::new().with_license(License::Platinum));
    let mut connector = waterfall_connector();
    connector.features.document_level_security_enabled = false;
    registry.insert(connector.clone());

    let attempts = scheduler(registry.clone(), false)
        .run(connector, cycle())
        .await
        .unwrap();

    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].job_type, JobType::Full);
}

#[tokio::test]
async fn test_license_gate_blocks_only_access_control() {
    for license in [License::Basic, License::Gold, License::Expired] {
        let registry = Arc::new(InMemoryRegistry::new().with_license(license));
        registry.insert(waterfall_connector());

        let attempts = scheduler(registry.clone(), true)
            .run(waterfall_connector(), cycle())
            .await
            .unwrap();

        assert_eq!(attempts[0].job_type, JobType::AccessControl);
        assert_eq!(
            attempts[0].outcome,
            SyncOutcome::LicenseInsufficient { actual: license }
        );
        assert!(registry
            .jobs_for("c1", JobType::AccessControl)
            .is_empty());
        assert_eq!(registry.jobs_for("c1", JobType::Incremental).len(), 1);
        assert_eq!(registry.jobs_for("c1", JobType::Full).len(), 1);
    }
}

/// Registry that requests shutdown as soon as a scheduling claim is written
struct CancelOnClaim {
    inner: Arc<InMemoryRegistry>,
    shutdown: CancellationToken,
}

#[async_trait]
impl ConnectorRegistry for CancelOnClaim {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn list_eligible_connectors<'a>(
        &'a self,
        native_service_types: &'a [String],
        connector_ids: &'a [String],
    ) -> BoxStream<'a, Result<Connector, RegistryError>> {
        self.inner
            .list_eligible_connectors(native_service_types, connector_ids)
    }

    async fn reload(&self, connector_id: &str) -> Result<Connector, RegistryError> {
        self.inner.reload(connector_id).await
    }

    async fn update_last_sync_scheduled_at(
        &self,
        connector_id: &str,
        job_type: JobType,
        expected_version: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let result = self
            .inner
            .update_last_sync_scheduled_at(connector_id, job_type, expected_version, scheduled_at)
            .await;
        self.shutdown.cancel();
        result
    }

    async fn create_job(
        &self,
        connector_id: &str,
        job_type: JobType,
        trigger_method: JobTriggerMethod,
    ) -> Result<SyncJob, RegistryError> {
        self.inner.create_job(connector_id, job_type, trigger_method).await
    }

    async fn license(&self) -> Result<License, RegistryError> {
        self.inner.license().await
    }

    async fn heartbeat(&self, connector_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        self.inner.heartbeat(connector_id, at).await
    }

    async fn mark_connected(&self, connector_id: &str) -> Result<(), RegistryError> {
        self.inner.mark_connected(connector_id).await
    }

    async fn record_error(&self, connector_id: &str, message: &str) -> Result<(), RegistryError> {
        self.inner.record_error(connector_id, message).await
    }

    async fn update_service_type_and_configuration(
        &self,
        connector_id: &str,
        service_type: Option<&str>,
        configuration: Option<&Configuration>,
    ) -> Result<(), RegistryError> {
        self.inner
            .update_service_type_and_configuration(connector_id, service_type, configuration)
            .await
    }

    async fn update_filtering_validation(
        &self,
        connector_id: &str,
        validation: &FilteringValidation,
    ) -> Result<(), RegistryError> {
        self.inner
            .update_filtering_validation(connector_id, validation)
            .await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_no_job_is_created_after_shutdown_is_requested() {
    let inner = Arc::new(InMemoryRegistry::new());
    inner.insert(connector("c1"));
    let shutdown = CancellationToken::new();
    let registry = Arc::new(CancelOnClaim {
        inner: inner.clone(),
        shutdown: shutdown.clone(),
    });

    let scheduler = ConnectorScheduler::new(registry, catalog(false), sources(), shutdown.clone());
    let job = scheduler
        .try_schedule_sync("c1", JobType::Full, recent_window())
        .await
        .unwrap();

    assert!(shutdown.is_cancelled());
    assert!(job.is_none());
    assert!(inner.jobs().is_empty());
    assert!(inner
        .connector("c1")
        .unwrap()
        .last_sync_scheduled_at
        .full
        .is_some());
}

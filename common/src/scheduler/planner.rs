// Sync-type waterfall and the optimistic scheduling protocol
//
// Several scheduler instances may evaluate the same connector in the same
// cycle. Exactly one of them wins the conditional write of the job type's
// last-scheduled-at timestamp, and only the winner creates the job.

use super::connector::{ConnectorScheduler, ReadyConnector};
use crate::concurrency::with_concurrency_control;
use crate::errors::{RegistryError, ScheduleError};
use crate::models::{Connector, JobTriggerMethod, JobType, License, SyncJob};
use crate::telemetry;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

/// Minimum license for access control syncs
pub const ACCESS_CONTROL_MINIMUM_LICENSE: License = License::Platinum;

/// The interval since the previous poll cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingWindow {
    pub last_wake_up_time: DateTime<Utc>,
}

impl SchedulingWindow {
    pub fn since(last_wake_up_time: DateTime<Utc>) -> Self {
        Self { last_wake_up_time }
    }
}

/// What a single job type evaluation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Scheduled(SyncJob),
    NotScheduled,
    LicenseInsufficient { actual: License },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAttempt {
    pub job_type: JobType,
    pub outcome: SyncOutcome,
}

/// Scheduling decision for one job type at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Due; claim by setting last-scheduled-at to this time
    Due(DateTime<Utc>),
    /// Another instance already scheduled this window
    ScheduledElsewhere(DateTime<Utc>),
    Disabled,
    NotDue(DateTime<Utc>),
}

/// Decide whether `job_type` is due for `connector` at `now`.
pub fn should_schedule(
    connector: &Connector,
    job_type: JobType,
    window: SchedulingWindow,
    now: DateTime<Utc>,
) -> Result<Decision, ScheduleError> {
    if let Some(last_scheduled) = connector.last_sync_scheduled_at_by_job_type(job_type) {
        if last_scheduled > window.last_wake_up_time {
            return Ok(Decision::ScheduledElsewhere(last_scheduled));
        }
    }

    match connector.next_sync(job_type, window.last_wake_up_time)? {
        None => Ok(Decision::Disabled),
        Some(next_sync) if now < next_sync => Ok(Decision::NotDue(next_sync)),
        Some(next_sync) => Ok(Decision::Due(next_sync)),
    }
}

impl ConnectorScheduler {
    /// Evaluate access control, incremental and full syncs in that order.
    /// Each attempt is independent of the others' outcome.
    pub async fn schedule_sync_types(
        &self,
        ready: &ReadyConnector,
        window: SchedulingWindow,
    ) -> Vec<SyncAttempt> {
        let connector = &ready.connector;
        let mut attempts = Vec::with_capacity(3);

        if connector.features.document_level_security_enabled {
            let outcome = match self.registry.license().await {
                Ok(license) if license.satisfies(ACCESS_CONTROL_MINIMUM_LICENSE) => {
                    self.attempt(&connector.id, JobType::AccessControl, window)
                        .await
                }
                Ok(license) => {
                    error!(
                        minimum_license = %ACCESS_CONTROL_MINIMUM_LICENSE,
                        actual_license = %license,
                        "Minimum required license: '{}'. Actual license: '{}'. Skipping access control sync scheduling...",
                        ACCESS_CONTROL_MINIMUM_LICENSE,
                        license
                    );
                    SyncOutcome::LicenseInsufficient { actual: license }
                }
                Err(e) => {
                    error!(error = %e, "Failed to read license");
                    SyncOutcome::Failed(e.to_string())
                }
            };
            attempts.push(SyncAttempt {
                job_type: JobType::AccessControl,
                outcome,
            });
        }

        if connector.features.incremental_sync_enabled && ready.supports_incremental_sync {
            attempts.push(SyncAttempt {
                job_type: JobType::Incremental,
                outcome: self.attempt(&connector.id, JobType::Incremental, window).await,
            });
        }

        attempts.push(SyncAttempt {
            job_type: JobType::Full,
            outcome: self.attempt(&connector.id, JobType::Full, window).await,
        });

        attempts
    }

    async fn attempt(
        &self,
        connector_id: &str,
        job_type: JobType,
        window: SchedulingWindow,
    ) -> SyncOutcome {
        match self.try_schedule_sync(connector_id, job_type, window).await {
            Ok(Some(job)) => SyncOutcome::Scheduled(job),
            Ok(None) => SyncOutcome::NotScheduled,
            Err(e) => {
                error!(job_type = %job_type, error = %e, "Failed to schedule sync");
                SyncOutcome::Failed(e.to_string())
            }
        }
    }

    /// Claim the current window for `job_type` and create a scheduled job.
    ///
    /// Returns `Ok(None)` when the job type is not due, disabled, claimed by
    /// another instance, or the service is shutting down.
    #[instrument(skip(self, window), fields(job_type = %job_type))]
    pub async fn try_schedule_sync(
        &self,
        connector_id: &str,
        job_type: JobType,
        window: SchedulingWindow,
    ) -> Result<Option<SyncJob>, RegistryError> {
        let this_wake_up_time = Utc::now();
        debug!(
            this_wake_up_time = %this_wake_up_time,
            last_wake_up_time = %window.last_wake_up_time,
            "Scheduler woke up"
        );

        let claimed = with_concurrency_control(&self.conflict_backoff, || {
            self.claim(connector_id, job_type, window, this_wake_up_time)
        })
        .await;

        let claimed = match claimed {
            Ok(claimed) => claimed,
            Err(e) if e.is_conflict() => false,
            Err(e) => return Err(e),
        };

        if !claimed {
            return Ok(None);
        }

        if !self.is_running() {
            debug!("Not creating a scheduled sync because the service is terminating");
            return Ok(None);
        }

        info!("Creating a scheduled '{}' sync...", job_type);
        let job = self
            .registry
            .create_job(connector_id, job_type, JobTriggerMethod::Scheduled)
            .await?;
        telemetry::record_job_scheduled(job_type.as_str());

        Ok(Some(job))
    }

    /// One read-modify-write round: reload, decide, conditionally write
    async fn claim(
        &self,
        connector_id: &str,
        job_type: JobType,
        window: SchedulingWindow,
        now: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let connector = match self.registry.reload(connector_id).await {
            Ok(connector) => connector,
            Err(RegistryError::NotFound(_)) => {
                error!("Couldn't reload connector");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match should_schedule(&connector, job_type, window, now) {
            Ok(Decision::Due(next_sync)) => {
                self.registry
                    .update_last_sync_scheduled_at(
                        connector_id,
                        job_type,
                        connector.version,
                        next_sync,
                    )
                    .await?;
                Ok(true)
            }
            Ok(Decision::ScheduledElsewhere(at)) => {
                debug!(
                    last_sync_scheduled_at = %at,
                    "A scheduled '{}' sync is created by another connector instance, skipping...",
                    job_type
                );
                Ok(false)
            }
            Ok(Decision::Disabled) => {
                debug!("'{}' sync scheduling is disabled", job_type);
                Ok(false)
            }
            Ok(Decision::NotDue(next_sync)) => {
                debug!(
                    next_sync = %next_sync,
                    "Next '{}' sync due in {} seconds",
                    job_type,
                    (next_sync - now).num_seconds()
                );
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, "Failed to compute next sync");
                self.persist_error(connector_id, &e.to_string()).await;
                Ok(false)
            }
        }
    }
}

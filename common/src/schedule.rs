// Schedule parsing and next sync time calculation
//
// Connector scheduling policies are quartz-style cron expressions with second
// precision, evaluated in UTC.

use crate::errors::ScheduleError;
use crate::models::SyncSchedule;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// ScheduleTrigger defines the interface for calculating next due times
pub trait ScheduleTrigger {
    /// Calculate the first due time strictly after `after`.
    /// `Ok(None)` means scheduling is disabled.
    fn next_execution_time(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

impl ScheduleTrigger for SyncSchedule {
    fn next_execution_time(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if !self.enabled {
            return Ok(None);
        }

        let schedule = parse_cron_expression(&self.interval)?;
        schedule
            .after(&after)
            .next()
            .map(Some)
            .ok_or_else(|| ScheduleError::NoNextExecution {
                expression: self.interval.clone(),
            })
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

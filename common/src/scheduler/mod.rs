// Connector job scheduling: readiness gate, sync-type waterfall, and the poll loop

pub mod connector;
pub mod engine;
pub mod planner;
pub mod readiness;
pub mod spurious;

pub use connector::{ConnectorScheduler, PollCycle, ReadyConnector};
pub use engine::{JobSchedulingService, Scheduler, SchedulerConfig, ServiceState};
pub use planner::{should_schedule, Decision, SchedulingWindow, SyncAttempt, SyncOutcome};
pub use spurious::SpuriousErrorPolicy;

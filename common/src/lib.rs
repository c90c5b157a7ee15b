// Common library for the connector job scheduler

pub mod bootstrap;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod pool;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod sources;
pub mod telemetry;

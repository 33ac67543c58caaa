//! Persistence for raw telemetry rows and derived analytics snapshots

pub mod analytics_store;
pub mod db;
pub mod raw_store;

pub use db::TelemetryDb;
pub use raw_store::UpsertOutcome;

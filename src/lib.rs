//! Speed-gauge telemetry backend
//!
//! Ingests weekly per-driver speed exports into SQLite and keeps rolling
//! company and driver analytics snapshots in sync with the raw rows.
//! Exposed as a library for the binaries and integration tests.

pub mod analytics;
pub mod config;
pub mod ingest;
pub mod models;
pub mod storage;

pub use config::EngineConfig;
pub use storage::TelemetryDb;

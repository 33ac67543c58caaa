//! Rolling analytics over the raw telemetry table
//!
//! - `bounds`: outlier filter computed once per run
//! - `planner`: which snapshot keys are missing
//! - `builder`: per-key stats and trend series
//! - `controller`: chunked, cancellable reconciliation runs

pub mod bounds;
pub mod builder;
pub mod controller;
pub mod planner;
pub mod stats;

pub use bounds::compute_bounds;
pub use controller::{KeyTally, ReconcileController, ReconcileReport, ReconcileScope};

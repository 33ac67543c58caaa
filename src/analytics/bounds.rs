//! Outlier filter bounds, computed once per reconciliation run

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use super::stats::{mean_or_zero, population_std_dev, round2};
use crate::models::{FilterBounds, Metric, MetricBounds};
use crate::storage::raw_store;

/// `mean ± k·stddev` per metric over observed rows.
///
/// Rows with an unknown interpolation flag count as observed. An empty table
/// yields `(0, 0)` bounds, so every value is filtered out until data arrives.
pub fn compute_bounds(conn: &Connection, stdev_threshold: f64) -> Result<FilterBounds> {
    let percent_speeding = metric_bounds(conn, Metric::PercentSpeeding, stdev_threshold)?;
    let distance_driven = metric_bounds(conn, Metric::DistanceDriven, stdev_threshold)?;

    Ok(FilterBounds {
        stdev_threshold,
        percent_speeding,
        distance_driven,
    })
}

fn metric_bounds(conn: &Connection, metric: Metric, k: f64) -> Result<MetricBounds> {
    let values = raw_store::observed_metric_values(conn, metric)?;
    let mean = mean_or_zero(&values);
    let sd = population_std_dev(&values);

    let max = round2(mean + k * sd);
    let mut min = round2(mean - k * sd);
    if metric.is_percentage() {
        min = 0.0;
    }

    debug!(
        metric = metric.column(),
        samples = values.len(),
        mean,
        sd,
        min,
        max,
        "filter bounds"
    );
    Ok(MetricBounds { min, max })
}

//! Aggregate builder: derives one snapshot's fields from raw rows
//!
//! Read-only. Every function takes the connection it should read through,
//! which lets build workers run on their own read-only handles.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use rusqlite::Connection;
use std::collections::BTreeMap;

use super::stats::{self, mean_or_zero, round2, summarize};
use crate::models::{
    CompanyKey, DriverKey, FilterBounds, Metric, MetricSnapshot, SnapshotFields, TrendSeries,
};
use crate::storage::raw_store::{self, MetricRow};

/// Company-wide stats for one reporting date.
///
/// Scope is every row dated `key.start_date`, restricted to observed rows
/// when generated rows are not allowed. The trend covers every row in the
/// trailing window whatever the flag.
pub fn build_company(
    conn: &Connection,
    key: &CompanyKey,
    bounds: &FilterBounds,
    window_days: i64,
) -> Result<SnapshotFields> {
    let date = key.start_date;
    let observed_only = !key.generated_allowed;

    let rows = raw_store::company_window(conn, date, date, observed_only)
        .with_context(|| format!("company rows for {}", date))?;
    let window = raw_store::company_window(conn, window_start(date, window_days), date, false)?;

    let previous = match raw_store::previous_company_date(conn, date, observed_only)? {
        Some(prev) => Some(raw_store::company_window(conn, prev, prev, observed_only)?),
        None => None,
    };

    let mut fields = SnapshotFields {
        records_count: rows.len() as i64,
        stdev_threshold: bounds.stdev_threshold,
        ..Default::default()
    };

    for metric in Metric::ALL {
        let summary = summarize(&filtered(&rows, metric, bounds));
        let prev_avg = previous
            .as_ref()
            .map(|prev| filtered(prev, metric, bounds))
            .filter(|values| !values.is_empty())
            .map(|values| mean_or_zero(&values));
        let (abs_change, percent_change) = stats::change(summary.avg, prev_avg);

        *fields.metric_mut(metric) = MetricSnapshot {
            count: summary.count,
            avg: summary.avg,
            max: summary.max,
            min: summary.min,
            stddev: summary.stddev,
            median: summary.median,
            abs_change,
            percent_change,
            current_week: None,
            previous_week: None,
            trend: trend_series(&window, metric, bounds),
        };
    }

    Ok(fields)
}

/// One driver's stats over the trailing window ending at `key.start_date`.
pub fn build_driver(
    conn: &Connection,
    key: &DriverKey,
    bounds: &FilterBounds,
    window_days: i64,
) -> Result<SnapshotFields> {
    let date = key.start_date;
    let rows = raw_store::driver_window(conn, key.driver_id, window_start(date, window_days), date)
        .with_context(|| format!("driver {} rows for {}", key.driver_id, date))?;

    let previous = match raw_store::previous_date(conn, Some(key.driver_id), date)? {
        Some(prev) => raw_store::driver_window(conn, key.driver_id, prev, prev)?,
        None => Vec::new(),
    };

    let mut fields = SnapshotFields {
        records_count: rows.len() as i64,
        stdev_threshold: bounds.stdev_threshold,
        ..Default::default()
    };

    for metric in Metric::ALL {
        let summary = summarize(&filtered(&rows, metric, bounds));

        // Week-over-week values are unfiltered.
        let current_week = unfiltered_mean(rows.iter().filter(|r| r.start_date == date), metric);
        let previous_week = unfiltered_mean(previous.iter(), metric);
        let (abs_change, percent_change) = stats::change(current_week, previous_week);

        *fields.metric_mut(metric) = MetricSnapshot {
            count: summary.count,
            avg: summary.avg,
            max: summary.max,
            min: summary.min,
            stddev: summary.stddev,
            median: summary.median,
            abs_change,
            percent_change,
            current_week,
            previous_week,
            trend: trend_series(&rows, metric, bounds),
        };
    }

    Ok(fields)
}

fn window_start(date: NaiveDateTime, window_days: i64) -> NaiveDateTime {
    date - Duration::days(window_days)
}

/// Non-null values inside the metric's bounds, in row order.
fn filtered(rows: &[MetricRow], metric: Metric, bounds: &FilterBounds) -> Vec<f64> {
    let b = bounds.get(metric);
    rows.iter()
        .filter_map(|r| r.value(metric))
        .filter(|v| b.contains(*v))
        .collect()
}

fn unfiltered_mean<'a>(rows: impl Iterator<Item = &'a MetricRow>, metric: Metric) -> Option<f64> {
    let values: Vec<f64> = rows.filter_map(|r| r.value(metric)).collect();
    if values.is_empty() {
        None
    } else {
        Some(mean_or_zero(&values))
    }
}

/// Mean of in-bounds values per calendar date, rounded to cents.
fn trend_series(rows: &[MetricRow], metric: Metric, bounds: &FilterBounds) -> TrendSeries {
    let b = bounds.get(metric);
    let mut by_date: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for row in rows {
        if let Some(v) = row.value(metric).filter(|v| b.contains(*v)) {
            by_date
                .entry(row.start_date.date().format("%Y-%m-%d").to_string())
                .or_default()
                .push(v);
        }
    }
    TrendSeries(
        by_date
            .into_iter()
            .map(|(date, values)| (date, round2(mean_or_zero(&values))))
            .collect(),
    )
}

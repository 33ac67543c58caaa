//! Company and driver analytics snapshot storage
//!
//! Snapshots are pure derived state: one row per key, overwritten on
//! recomputation, deleted only by invalidation or a full rebuild.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;

use crate::models::{
    CompanyKey, CompanySnapshot, DriverKey, DriverSnapshot, Metric, MetricSnapshot,
    SnapshotFields, TrendSeries,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Company,
    Driver,
}

impl Scope {
    fn table(&self) -> &'static str {
        match self {
            Scope::Company => "company_analytics",
            Scope::Driver => "driver_analytics",
        }
    }

    fn key_columns(&self) -> [&'static str; 2] {
        match self {
            Scope::Company => ["start_date", "generated_records_allowed"],
            Scope::Driver => ["driver_id", "start_date"],
        }
    }

    fn threshold_column(&self) -> &'static str {
        match self {
            Scope::Company => "std_filter_value",
            Scope::Driver => "std_filter_threshold",
        }
    }

    /// Per-metric column prefixes; driver rows also carry week-over-week values.
    fn metric_prefixes(&self) -> &'static [&'static str] {
        match self {
            Scope::Company => &[
                "count", "max", "min", "avg", "median", "std", "abs_change", "percent_change",
            ],
            Scope::Driver => &[
                "count",
                "max",
                "min",
                "avg",
                "median",
                "std",
                "abs_change",
                "percent_change",
                "current_week",
                "previous_week",
            ],
        }
    }

    /// Non-key columns in write order.
    fn value_columns(&self) -> Vec<String> {
        let mut cols = vec!["records_count".to_string(), self.threshold_column().to_string()];
        for metric in Metric::ALL {
            for prefix in self.metric_prefixes() {
                cols.push(format!("{}_{}", prefix, metric.column()));
            }
        }
        for metric in Metric::ALL {
            cols.push(metric.trend_column().to_string());
        }
        cols
    }

    fn value_params(&self, fields: &SnapshotFields) -> Vec<Value> {
        let mut values = vec![
            Value::Integer(fields.records_count),
            Value::Real(fields.stdev_threshold),
        ];
        for metric in Metric::ALL {
            let m = fields.metric(metric);
            for prefix in self.metric_prefixes() {
                values.push(match *prefix {
                    "count" => Value::Integer(m.count),
                    "max" => real(m.max),
                    "min" => real(m.min),
                    "avg" => real(m.avg),
                    "median" => real(m.median),
                    "std" => real(m.stddev),
                    "abs_change" => real(m.abs_change),
                    "percent_change" => real(m.percent_change),
                    "current_week" => real(m.current_week),
                    "previous_week" => real(m.previous_week),
                    _ => Value::Null,
                });
            }
        }
        for metric in Metric::ALL {
            values.push(Value::Text(fields.metric(metric).trend.to_blob()));
        }
        values
    }

    fn upsert_sql(&self) -> String {
        let [k1, k2] = self.key_columns();
        let cols = self.value_columns();
        let all_cols = [k1.to_string(), k2.to_string()]
            .into_iter()
            .chain(cols.iter().cloned())
            .collect::<Vec<_>>();
        let placeholders = (1..=all_cols.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = cols
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(",\n                ");
        format!(
            "INSERT INTO {table} ({cols}) VALUES ({placeholders})
             ON CONFLICT({k1}, {k2}) DO UPDATE SET
                {updates}",
            table = self.table(),
            cols = all_cols.join(", "),
        )
    }

    fn select_sql(&self, filter: &str) -> String {
        let [k1, k2] = self.key_columns();
        format!(
            "SELECT {k1}, {k2}, {cols} FROM {table} WHERE {filter}",
            cols = self.value_columns().join(", "),
            table = self.table(),
        )
    }

    fn fields_from_row(&self, row: &Row<'_>) -> rusqlite::Result<SnapshotFields> {
        let mut fields = SnapshotFields {
            records_count: row.get("records_count")?,
            stdev_threshold: row
                .get::<_, Option<f64>>(self.threshold_column())?
                .unwrap_or_default(),
            ..Default::default()
        };
        for metric in Metric::ALL {
            let col = metric.column();
            let get = |prefix: &str| -> rusqlite::Result<Option<f64>> {
                row.get(format!("{}_{}", prefix, col).as_str())
            };
            let mut m = MetricSnapshot {
                count: row.get(format!("count_{}", col).as_str())?,
                max: get("max")?,
                min: get("min")?,
                avg: get("avg")?,
                median: get("median")?,
                stddev: get("std")?,
                abs_change: get("abs_change")?,
                percent_change: get("percent_change")?,
                trend: TrendSeries::from_blob(
                    &row.get::<_, String>(metric.trend_column())?,
                ),
                ..Default::default()
            };
            if *self == Scope::Driver {
                m.current_week = get("current_week")?;
                m.previous_week = get("previous_week")?;
            }
            *fields.metric_mut(metric) = m;
        }
        Ok(fields)
    }
}

fn real(v: Option<f64>) -> Value {
    match v {
        Some(f) if f.is_finite() => Value::Real(f),
        _ => Value::Null,
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Insert or overwrite the company snapshot for `key`.
pub fn upsert_company(conn: &Connection, key: &CompanyKey, fields: &SnapshotFields) -> Result<()> {
    let scope = Scope::Company;
    let mut values = vec![
        Value::Text(key.start_date.format("%F %T").to_string()),
        Value::Integer(key.generated_allowed as i64),
    ];
    values.extend(scope.value_params(fields));
    conn.execute(&scope.upsert_sql(), params_from_iter(values.iter()))
        .with_context(|| format!("company snapshot upsert failed for {:?}", key))?;
    Ok(())
}

/// Insert or overwrite the driver snapshot for `key`.
pub fn upsert_driver(conn: &Connection, key: &DriverKey, fields: &SnapshotFields) -> Result<()> {
    let scope = Scope::Driver;
    let mut values = vec![
        Value::Integer(key.driver_id),
        Value::Text(key.start_date.format("%F %T").to_string()),
    ];
    values.extend(scope.value_params(fields));
    conn.execute(&scope.upsert_sql(), params_from_iter(values.iter()))
        .with_context(|| format!("driver snapshot upsert failed for {:?}", key))?;
    Ok(())
}

/// Drop snapshots whose inputs include a raw row dated `date` (for `driver_id`
/// when known). Company snapshots are dropped regardless of driver.
pub fn invalidate_from(
    conn: &Connection,
    driver_id: Option<i64>,
    date: NaiveDateTime,
    window_days: i64,
) -> Result<usize> {
    let until = date + Duration::days(window_days);
    let mut removed = conn.execute(
        "DELETE FROM company_analytics WHERE start_date >= ?1 AND start_date <= ?2",
        params![date, until],
    )?;
    if let Some(id) = driver_id {
        removed += conn.execute(
            "DELETE FROM driver_analytics
             WHERE driver_id = ?1 AND start_date >= ?2 AND start_date <= ?3",
            params![id, date, until],
        )?;
    }
    Ok(removed)
}

/// Remove every snapshot so the next run replays the whole raw store.
pub fn clear_all(conn: &Connection) -> Result<usize> {
    let company = conn.execute("DELETE FROM company_analytics", [])?;
    let driver = conn.execute("DELETE FROM driver_analytics", [])?;
    Ok(company + driver)
}

// =============================================================================
// Reads
// =============================================================================

pub fn company_keys(conn: &Connection) -> Result<HashSet<CompanyKey>> {
    let mut stmt =
        conn.prepare("SELECT start_date, generated_records_allowed FROM company_analytics")?;
    let keys = stmt
        .query_map([], |row| {
            Ok(CompanyKey {
                start_date: row.get(0)?,
                generated_allowed: row.get(1)?,
            })
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(keys)
}

pub fn driver_keys(conn: &Connection) -> Result<HashSet<DriverKey>> {
    let mut stmt = conn.prepare("SELECT driver_id, start_date FROM driver_analytics")?;
    let keys = stmt
        .query_map([], |row| {
            Ok(DriverKey {
                driver_id: row.get(0)?,
                start_date: row.get(1)?,
            })
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(keys)
}

pub fn company_snapshot(
    conn: &Connection,
    start_date: NaiveDateTime,
    generated_allowed: bool,
) -> Result<Option<CompanySnapshot>> {
    let scope = Scope::Company;
    let sql = scope.select_sql("start_date = ?1 AND generated_records_allowed = ?2");
    let snapshot = conn
        .query_row(&sql, params![start_date, generated_allowed], |row| {
            Ok(CompanySnapshot {
                key: CompanyKey {
                    start_date: row.get(0)?,
                    generated_allowed: row.get(1)?,
                },
                fields: scope.fields_from_row(row)?,
            })
        })
        .optional()?;
    Ok(snapshot)
}

pub fn driver_snapshot(
    conn: &Connection,
    driver_id: i64,
    start_date: NaiveDateTime,
) -> Result<Option<DriverSnapshot>> {
    let scope = Scope::Driver;
    let sql = scope.select_sql("driver_id = ?1 AND start_date = ?2");
    let snapshot = conn
        .query_row(&sql, params![driver_id, start_date], |row| {
            Ok(DriverSnapshot {
                key: DriverKey {
                    driver_id: row.get(0)?,
                    start_date: row.get(1)?,
                },
                fields: scope.fields_from_row(row)?,
            })
        })
        .optional()?;
    Ok(snapshot)
}

/// Every company snapshot, oldest first (used for reproducibility checks).
pub fn all_company_snapshots(conn: &Connection) -> Result<Vec<CompanySnapshot>> {
    let scope = Scope::Company;
    let sql = format!(
        "{} ORDER BY start_date, generated_records_allowed",
        scope.select_sql("1 = 1")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CompanySnapshot {
                key: CompanyKey {
                    start_date: row.get(0)?,
                    generated_allowed: row.get(1)?,
                },
                fields: scope.fields_from_row(row)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every driver snapshot ordered by key.
pub fn all_driver_snapshots(conn: &Connection) -> Result<Vec<DriverSnapshot>> {
    let scope = Scope::Driver;
    let sql = format!("{} ORDER BY driver_id, start_date", scope.select_sql("1 = 1"));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DriverSnapshot {
                key: DriverKey {
                    driver_id: row.get(0)?,
                    start_date: row.get(1)?,
                },
                fields: scope.fields_from_row(row)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `(company snapshots, driver snapshots)`
pub fn counts(conn: &Connection) -> Result<(i64, i64)> {
    let company = conn.query_row("SELECT COUNT(*) FROM company_analytics", [], |r| r.get(0))?;
    let driver = conn.query_row("SELECT COUNT(*) FROM driver_analytics", [], |r| r.get(0))?;
    Ok((company, driver))
}

// =============================================================================
// Tests
// =============================================================================

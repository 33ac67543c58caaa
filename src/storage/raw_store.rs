//! Raw telemetry row storage
//!
//! Upsert by the natural key `(driver_id, start_date, end_date)` plus the
//! read paths used by the analytics side and by display collaborators.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::models::{Metric, RawTelemetryRecord};

/// Column order shared by INSERT, UPDATE and SELECT.
const RAW_COLUMNS: [&str; 32] = [
    "driver_id",
    "start_date",
    "end_date",
    "driver_name",
    "first_name",
    "last_name",
    "vehicle_type",
    "percent_speeding",
    "distance_driven",
    "is_interpolated",
    "max_speed_non_interstate_freeway",
    "percent_speeding_non_interstate_freeway",
    "max_speed_interstate_freeway",
    "percent_speeding_interstate_freeway",
    "worst_incident_date",
    "incident_location",
    "speed_limit",
    "speed",
    "speed_cap",
    "custom_speed_restriction",
    "url",
    "url_lat",
    "url_lon",
    "location",
    "percent_speeding_numerator",
    "percent_speeding_denominator",
    "incidents_interstate_freeway",
    "observations_interstate_freeway",
    "incidents_non_interstate_freeway",
    "observations_non_interstate_freeway",
    "difference",
    "raw_json",
];

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same key and identical parsed snapshot; nothing written
    Unchanged,
}

impl UpsertOutcome {
    /// Whether derived snapshots depending on this row are now stale.
    pub fn changed(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Date plus the two tracked metric values of one raw row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricRow {
    pub start_date: NaiveDateTime,
    pub percent_speeding: Option<f64>,
    pub distance_driven: Option<f64>,
}

impl MetricRow {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::PercentSpeeding => self.percent_speeding,
            Metric::DistanceDriven => self.distance_driven,
        }
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Insert or overwrite one record keyed by `(driver_id, start_date, end_date)`.
///
/// Rows without a driver id are additionally matched on `driver_name`, so two
/// unresolved drivers in the same period stay separate rows.
pub fn upsert(conn: &Connection, record: &RawTelemetryRecord) -> Result<UpsertOutcome> {
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, raw_json FROM speedgauge_data
             WHERE driver_id IS ?1 AND start_date = ?2 AND end_date = ?3
               AND (?1 IS NOT NULL OR driver_name = ?4)
             ORDER BY id
             LIMIT 1",
            params![
                record.driver_id,
                record.start_date,
                record.end_date,
                record.driver_name
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("raw row lookup failed")?;

    let values = bind_values(record);

    match existing {
        Some((_, raw_json)) if raw_json == record.raw_json => Ok(UpsertOutcome::Unchanged),
        Some((id, _)) => {
            let assignments = RAW_COLUMNS
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{} = ?{}", col, i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE speedgauge_data SET {} WHERE id = ?{}",
                assignments,
                RAW_COLUMNS.len() + 1
            );
            let mut bound = values;
            bound.push(&id);
            conn.execute(&sql, &bound[..])
                .with_context(|| format!("update of raw row {} failed", id))?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            let placeholders = (1..=RAW_COLUMNS.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO speedgauge_data ({}) VALUES ({})",
                RAW_COLUMNS.join(", "),
                placeholders
            );
            conn.execute(&sql, &values[..])
                .context("insert of raw row failed")?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

fn bind_values(r: &RawTelemetryRecord) -> Vec<&dyn ToSql> {
    vec![
        &r.driver_id,
        &r.start_date,
        &r.end_date,
        &r.driver_name,
        &r.first_name,
        &r.last_name,
        &r.vehicle_type,
        &r.percent_speeding,
        &r.distance_driven,
        &r.is_interpolated,
        &r.max_speed_non_interstate_freeway,
        &r.percent_speeding_non_interstate_freeway,
        &r.max_speed_interstate_freeway,
        &r.percent_speeding_interstate_freeway,
        &r.worst_incident_date,
        &r.incident_location,
        &r.speed_limit,
        &r.speed,
        &r.speed_cap,
        &r.custom_speed_restriction,
        &r.url,
        &r.url_lat,
        &r.url_lon,
        &r.location,
        &r.percent_speeding_numerator,
        &r.percent_speeding_denominator,
        &r.incidents_interstate_freeway,
        &r.observations_interstate_freeway,
        &r.incidents_non_interstate_freeway,
        &r.observations_non_interstate_freeway,
        &r.difference,
        &r.raw_json,
    ]
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RawTelemetryRecord> {
    Ok(RawTelemetryRecord {
        driver_id: row.get(0)?,
        start_date: row.get(1)?,
        end_date: row.get(2)?,
        driver_name: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        vehicle_type: row.get(6)?,
        percent_speeding: row.get(7)?,
        distance_driven: row.get(8)?,
        is_interpolated: row.get(9)?,
        max_speed_non_interstate_freeway: row.get(10)?,
        percent_speeding_non_interstate_freeway: row.get(11)?,
        max_speed_interstate_freeway: row.get(12)?,
        percent_speeding_interstate_freeway: row.get(13)?,
        worst_incident_date: row.get(14)?,
        incident_location: row.get(15)?,
        speed_limit: row.get(16)?,
        speed: row.get(17)?,
        speed_cap: row.get(18)?,
        custom_speed_restriction: row.get(19)?,
        url: row.get(20)?,
        url_lat: row.get(21)?,
        url_lon: row.get(22)?,
        location: row.get(23)?,
        percent_speeding_numerator: row.get(24)?,
        percent_speeding_denominator: row.get(25)?,
        incidents_interstate_freeway: row.get(26)?,
        observations_interstate_freeway: row.get(27)?,
        incidents_non_interstate_freeway: row.get(28)?,
        observations_non_interstate_freeway: row.get(29)?,
        difference: row.get(30)?,
        raw_json: row.get(31)?,
    })
}

// =============================================================================
// Reads for display collaborators
// =============================================================================

pub fn count(conn: &Connection) -> Result<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM speedgauge_data", [], |row| row.get(0))?;
    Ok(n)
}

/// Every reporting date present, oldest first.
pub fn distinct_start_dates(conn: &Connection) -> Result<Vec<NaiveDateTime>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT start_date FROM speedgauge_data ORDER BY start_date ASC")?;
    let dates = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dates)
}

/// Reporting dates on or after `cutoff`, oldest first.
pub fn dates_since(conn: &Connection, cutoff: NaiveDateTime) -> Result<Vec<NaiveDateTime>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT start_date FROM speedgauge_data
         WHERE start_date >= ?1 ORDER BY start_date ASC",
    )?;
    let dates = stmt
        .query_map(params![cutoff], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dates)
}

/// A driver's full history, newest first.
pub fn rows_for_driver(conn: &Connection, driver_id: i64) -> Result<Vec<RawTelemetryRecord>> {
    let sql = format!(
        "SELECT {} FROM speedgauge_data WHERE driver_id = ?1 ORDER BY start_date DESC, id",
        RAW_COLUMNS.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![driver_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn row_for_driver_on(
    conn: &Connection,
    driver_id: i64,
    start_date: NaiveDateTime,
) -> Result<Option<RawTelemetryRecord>> {
    let sql = format!(
        "SELECT {} FROM speedgauge_data WHERE driver_id = ?1 AND start_date = ?2
         ORDER BY id LIMIT 1",
        RAW_COLUMNS.join(", ")
    );
    let row = conn
        .query_row(&sql, params![driver_id, start_date], record_from_row)
        .optional()?;
    Ok(row)
}

// =============================================================================
// Reads for the analytics side
// =============================================================================

/// Non-null values of `metric` over observed (non-generated) rows, ascending.
pub fn observed_metric_values(conn: &Connection, metric: Metric) -> Result<Vec<f64>> {
    let sql = format!(
        "SELECT {col} FROM speedgauge_data
         WHERE {col} IS NOT NULL AND COALESCE(is_interpolated, 0) = 0
         ORDER BY {col} ASC",
        col = metric.column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let values = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<f64>, _>>()?;
    Ok(values)
}

/// All drivers' rows dated within `[from, to]`.
pub fn company_window(
    conn: &Connection,
    from: NaiveDateTime,
    to: NaiveDateTime,
    observed_only: bool,
) -> Result<Vec<MetricRow>> {
    let mut stmt = conn.prepare(
        "SELECT start_date, percent_speeding, distance_driven FROM speedgauge_data
         WHERE start_date >= ?1 AND start_date <= ?2
           AND (?3 = 0 OR COALESCE(is_interpolated, 0) = 0)
         ORDER BY start_date ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![from, to, observed_only], metric_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One driver's rows dated within `[from, to]`.
pub fn driver_window(
    conn: &Connection,
    driver_id: i64,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<Vec<MetricRow>> {
    let mut stmt = conn.prepare(
        "SELECT start_date, percent_speeding, distance_driven FROM speedgauge_data
         WHERE driver_id = ?1 AND start_date >= ?2 AND start_date <= ?3
         ORDER BY start_date ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![driver_id, from, to], metric_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Latest reporting date strictly before `date`.
pub fn previous_date(
    conn: &Connection,
    driver_id: Option<i64>,
    date: NaiveDateTime,
) -> Result<Option<NaiveDateTime>> {
    let prev: Option<NaiveDateTime> = conn.query_row(
        "SELECT MAX(start_date) FROM speedgauge_data
         WHERE start_date < ?1 AND (?2 IS NULL OR driver_id = ?2)",
        params![date, driver_id],
        |row| row.get(0),
    )?;
    Ok(prev)
}

/// Latest company reporting date strictly before `date`, counting only
/// observed rows when `observed_only` is set.
pub fn previous_company_date(
    conn: &Connection,
    date: NaiveDateTime,
    observed_only: bool,
) -> Result<Option<NaiveDateTime>> {
    let prev: Option<NaiveDateTime> = conn.query_row(
        "SELECT MAX(start_date) FROM speedgauge_data
         WHERE start_date < ?1
           AND (?2 = 0 OR COALESCE(is_interpolated, 0) = 0)",
        params![date, observed_only],
        |row| row.get(0),
    )?;
    Ok(prev)
}

fn metric_row(row: &Row<'_>) -> rusqlite::Result<MetricRow> {
    Ok(MetricRow {
        start_date: row.get(0)?,
        percent_speeding: row.get(1)?,
        distance_driven: row.get(2)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TelemetryDb;
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn make_record(driver_id: Option<i64>, name: &str, pct: Option<f64>) -> RawTelemetryRecord {
        RawTelemetryRecord {
            driver_id,
            start_date: day(2024, 1, 1),
            end_date: day(2024, 1, 7),
            driver_name: name.to_string(),
            percent_speeding: pct,
            distance_driven: Some(1200.0),
            raw_json: format!(r#"{{"driver_name":"{}","percent_speeding":{:?}}}"#, name, pct),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_insert_then_unchanged() {
        let db = TelemetryDb::open_memory().unwrap();
        let rec = make_record(Some(42), "Al Smith", Some(95.0));

        assert_eq!(upsert(db.conn(), &rec).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(upsert(db.conn(), &rec).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(count(db.conn()).unwrap(), 1);
    }

    #[test]
    fn test_upsert_overwrites_and_clears_fields() {
        let db = TelemetryDb::open_memory().unwrap();
        let mut rec = make_record(Some(42), "Al Smith", Some(95.0));
        rec.location = Some("Depot 7".to_string());
        upsert(db.conn(), &rec).unwrap();

        let mut newer = make_record(Some(42), "Al Smith", Some(12.5));
        newer.location = None;
        assert_eq!(upsert(db.conn(), &newer).unwrap(), UpsertOutcome::Updated);

        let stored = row_for_driver_on(db.conn(), 42, day(2024, 1, 1))
            .unwrap()
            .unwrap();
        assert_eq!(stored.percent_speeding, Some(12.5));
        assert_eq!(stored.location, None);
        assert_eq!(count(db.conn()).unwrap(), 1);
    }

    #[test]
    fn test_unresolved_drivers_stay_separate() {
        let db = TelemetryDb::open_memory().unwrap();
        upsert(db.conn(), &make_record(None, "Jane Doe", Some(5.0))).unwrap();
        upsert(db.conn(), &make_record(None, "John Roe", Some(7.0))).unwrap();
        assert_eq!(count(db.conn()).unwrap(), 2);

        // Re-ingesting an unresolved driver still matches its own row
        let again = make_record(None, "Jane Doe", Some(6.0));
        assert_eq!(upsert(db.conn(), &again).unwrap(), UpsertOutcome::Updated);
        assert_eq!(count(db.conn()).unwrap(), 2);
    }

    #[test]
    fn test_observed_values_skip_generated_rows() {
        let db = TelemetryDb::open_memory().unwrap();
        let mut generated = make_record(Some(1), "Gen Erated", Some(80.0));
        generated.is_interpolated = Some(true);
        upsert(db.conn(), &generated).unwrap();
        upsert(db.conn(), &make_record(Some(2), "Obs Erved", Some(10.0))).unwrap();

        let mut unknown_flag = make_record(Some(3), "Un Known", Some(20.0));
        unknown_flag.is_interpolated = None;
        upsert(db.conn(), &unknown_flag).unwrap();

        let values = observed_metric_values(db.conn(), Metric::PercentSpeeding).unwrap();
        assert_eq!(values, vec![10.0, 20.0]);
    }

    #[test]
    fn test_windows_and_previous_date() {
        let db = TelemetryDb::open_memory().unwrap();
        for (i, d) in [day(2024, 1, 1), day(2024, 1, 8), day(2024, 1, 15)]
            .into_iter()
            .enumerate()
        {
            let mut rec = make_record(Some(7), "Ann Lee", Some(i as f64));
            rec.start_date = d;
            rec.end_date = d + chrono::Duration::days(6);
            upsert(db.conn(), &rec).unwrap();
        }

        let rows = driver_window(db.conn(), 7, day(2024, 1, 8), day(2024, 1, 15)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_date, day(2024, 1, 8));

        let prev = previous_date(db.conn(), Some(7), day(2024, 1, 15)).unwrap();
        assert_eq!(prev, Some(day(2024, 1, 8)));
        assert_eq!(previous_date(db.conn(), None, day(2024, 1, 1)).unwrap(), None);

        assert_eq!(
            previous_company_date(db.conn(), day(2024, 1, 15), true).unwrap(),
            Some(day(2024, 1, 8))
        );

        assert_eq!(distinct_start_dates(db.conn()).unwrap().len(), 3);
        assert_eq!(dates_since(db.conn(), day(2024, 1, 8)).unwrap().len(), 2);
        assert_eq!(rows_for_driver(db.conn(), 7).unwrap()[0].start_date, day(2024, 1, 15));
    }

    #[test]
    fn test_previous_company_date_skips_generated_only_dates() {
        let db = TelemetryDb::open_memory().unwrap();
        upsert(db.conn(), &make_record(Some(1), "Ann Lee", Some(4.0))).unwrap();

        let mut generated = make_record(Some(1), "Ann Lee", Some(9.0));
        generated.start_date = day(2024, 1, 8);
        generated.end_date = day(2024, 1, 14);
        generated.is_interpolated = Some(true);
        upsert(db.conn(), &generated).unwrap();

        let key_date = day(2024, 1, 15);
        assert_eq!(
            previous_company_date(db.conn(), key_date, false).unwrap(),
            Some(day(2024, 1, 8))
        );
        assert_eq!(
            previous_company_date(db.conn(), key_date, true).unwrap(),
            Some(day(2024, 1, 1))
        );
    }
}

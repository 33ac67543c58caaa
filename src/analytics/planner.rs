//! Finds analytics keys that have raw data but no snapshot yet
//!
//! Output is sorted so logs are stable between runs. Each key is an
//! independent unit of work.

use anyhow::Result;
use rusqlite::Connection;

use crate::models::{CompanyKey, DriverKey};
use crate::storage::{analytics_store, raw_store};

/// Both `(date, generated_allowed)` variants for every reporting date, minus
/// the ones already stored.
pub fn missing_company_keys(conn: &Connection) -> Result<Vec<CompanyKey>> {
    let existing = analytics_store::company_keys(conn)?;

    let mut missing = Vec::new();
    for start_date in raw_store::distinct_start_dates(conn)? {
        for generated_allowed in [true, false] {
            let key = CompanyKey {
                start_date,
                generated_allowed,
            };
            if !existing.contains(&key) {
                missing.push(key);
            }
        }
    }
    missing.sort();
    Ok(missing)
}

/// `(driver_id, start_date)` pairs with raw rows but no driver snapshot.
/// Rows without a resolved driver id never produce driver keys.
pub fn missing_driver_keys(conn: &Connection) -> Result<Vec<DriverKey>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT d.driver_id, d.start_date
         FROM speedgauge_data d
         LEFT JOIN driver_analytics a
           ON a.driver_id = d.driver_id AND a.start_date = d.start_date
         WHERE d.driver_id IS NOT NULL AND a.id IS NULL
         ORDER BY d.driver_id, d.start_date",
    )?;
    let keys = stmt
        .query_map([], |row| {
            Ok(DriverKey {
                driver_id: row.get(0)?,
                start_date: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawTelemetryRecord, SnapshotFields};
    use crate::storage::TelemetryDb;
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn make_row(driver_id: Option<i64>, name: &str, start: NaiveDateTime) -> RawTelemetryRecord {
        RawTelemetryRecord {
            driver_id,
            start_date: start,
            end_date: start,
            driver_name: name.to_string(),
            percent_speeding: Some(5.0),
            raw_json: format!("{}-{}", name, start),
            ..Default::default()
        }
    }

    #[test]
    fn test_company_keys_cover_both_variants() {
        let db = TelemetryDb::open_memory().unwrap();
        raw_store::upsert(db.conn(), &make_row(Some(1), "A B", day(1))).unwrap();
        raw_store::upsert(db.conn(), &make_row(Some(1), "A B", day(8))).unwrap();

        let missing = missing_company_keys(db.conn()).unwrap();
        assert_eq!(missing.len(), 4);

        let done = CompanyKey {
            start_date: day(1),
            generated_allowed: true,
        };
        analytics_store::upsert_company(db.conn(), &done, &SnapshotFields::default()).unwrap();

        let missing = missing_company_keys(db.conn()).unwrap();
        assert_eq!(missing.len(), 3);
        assert!(!missing.contains(&done));
    }

    #[test]
    fn test_driver_keys_skip_unresolved_rows() {
        let db = TelemetryDb::open_memory().unwrap();
        raw_store::upsert(db.conn(), &make_row(Some(7), "Jane Doe", day(1))).unwrap();
        raw_store::upsert(db.conn(), &make_row(None, "Al Smith", day(1))).unwrap();

        let missing = missing_driver_keys(db.conn()).unwrap();
        assert_eq!(
            missing,
            vec![DriverKey {
                driver_id: 7,
                start_date: day(1)
            }]
        );

        analytics_store::upsert_driver(db.conn(), &missing[0], &SnapshotFields::default())
            .unwrap();
        assert!(missing_driver_keys(db.conn()).unwrap().is_empty());
    }
}

//! SQLite handle and schema for raw telemetry and analytics snapshots
//!
//! - WAL mode so collaborators can read snapshots while a run writes
//! - One raw table (source of truth) and two derived snapshot tables
//! - Natural keys enforced by unique indexes

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Storage Schema
// =============================================================================

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

-- Raw per-driver, per-period rows (source of truth)
CREATE TABLE IF NOT EXISTS speedgauge_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id INTEGER,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    driver_name TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    vehicle_type TEXT,
    percent_speeding REAL,
    distance_driven REAL,
    is_interpolated INTEGER,
    max_speed_non_interstate_freeway REAL,
    percent_speeding_non_interstate_freeway REAL,
    max_speed_interstate_freeway REAL,
    percent_speeding_interstate_freeway REAL,
    worst_incident_date TEXT,
    incident_location TEXT,
    speed_limit REAL,
    speed REAL,
    speed_cap TEXT,
    custom_speed_restriction TEXT,
    url TEXT,
    url_lat REAL,
    url_lon REAL,
    location TEXT,
    percent_speeding_numerator REAL,
    percent_speeding_denominator REAL,
    incidents_interstate_freeway REAL,
    observations_interstate_freeway REAL,
    incidents_non_interstate_freeway REAL,
    observations_non_interstate_freeway REAL,
    difference REAL,
    raw_json TEXT NOT NULL
);

-- NULL driver ids are matched by name in code; SQLite treats NULLs as distinct here
CREATE UNIQUE INDEX IF NOT EXISTS idx_speedgauge_natural_key
    ON speedgauge_data(driver_id, start_date, end_date)
    WHERE driver_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_speedgauge_unresolved
    ON speedgauge_data(start_date, end_date, driver_name)
    WHERE driver_id IS NULL;

CREATE INDEX IF NOT EXISTS idx_speedgauge_start_date
    ON speedgauge_data(start_date);

CREATE INDEX IF NOT EXISTS idx_speedgauge_driver_date
    ON speedgauge_data(driver_id, start_date);

-- One snapshot per (reporting date, generated rows allowed)
CREATE TABLE IF NOT EXISTS company_analytics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_date TEXT NOT NULL,
    generated_records_allowed INTEGER NOT NULL,
    records_count INTEGER NOT NULL,
    std_filter_value REAL,
    count_percent_speeding INTEGER NOT NULL,
    max_percent_speeding REAL,
    min_percent_speeding REAL,
    avg_percent_speeding REAL,
    median_percent_speeding REAL,
    std_percent_speeding REAL,
    abs_change_percent_speeding REAL,
    percent_change_percent_speeding REAL,
    count_distance_driven INTEGER NOT NULL,
    max_distance_driven REAL,
    min_distance_driven REAL,
    avg_distance_driven REAL,
    median_distance_driven REAL,
    std_distance_driven REAL,
    abs_change_distance_driven REAL,
    percent_change_distance_driven REAL,
    speeding_trend_json TEXT NOT NULL,
    distance_trend_json TEXT NOT NULL,
    UNIQUE(start_date, generated_records_allowed)
);

-- One snapshot per (driver, reporting date) over the trailing window
CREATE TABLE IF NOT EXISTS driver_analytics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id INTEGER NOT NULL,
    start_date TEXT NOT NULL,
    std_filter_threshold REAL,
    records_count INTEGER NOT NULL,
    current_week_percent_speeding REAL,
    previous_week_percent_speeding REAL,
    count_percent_speeding INTEGER NOT NULL,
    max_percent_speeding REAL,
    min_percent_speeding REAL,
    avg_percent_speeding REAL,
    median_percent_speeding REAL,
    std_percent_speeding REAL,
    abs_change_percent_speeding REAL,
    percent_change_percent_speeding REAL,
    current_week_distance_driven REAL,
    previous_week_distance_driven REAL,
    count_distance_driven INTEGER NOT NULL,
    max_distance_driven REAL,
    min_distance_driven REAL,
    avg_distance_driven REAL,
    median_distance_driven REAL,
    std_distance_driven REAL,
    abs_change_distance_driven REAL,
    percent_change_distance_driven REAL,
    speeding_trend_json TEXT NOT NULL,
    distance_trend_json TEXT NOT NULL,
    UNIQUE(driver_id, start_date)
);

CREATE INDEX IF NOT EXISTS idx_driver_analytics_date
    ON driver_analytics(start_date);
"#;

// =============================================================================
// Storage Implementation
// =============================================================================

/// Owned connection to the telemetry database.
///
/// Components never hold on to this; they borrow a `&Connection`,
/// `Transaction` or `Savepoint` for the duration of one call.
pub struct TelemetryDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl TelemetryDb {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(path = %path.display(), "📊 Telemetry database opened");

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, path: None })
    }

    /// Read-only side connection for a build worker.
    pub fn open_reader(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open reader on {}", path.display()))?;
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// File backing this handle; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

//! Snapshot Inspection Tool
//!
//! Read-only view of what the engine has stored, printed as JSON for the
//! display side (and for eyeballing reconciliation output).
//!
//! Usage:
//!   cargo run --bin snapshot_inspect -- --db-path ./data/speedgauge.db dates
//!   cargo run --bin snapshot_inspect -- --db-path ./data/speedgauge.db company --date 2024-01-01
//!   cargo run --bin snapshot_inspect -- --db-path ./data/speedgauge.db driver --driver-id 42 --date 2024-01-01
//!   cargo run --bin snapshot_inspect -- --db-path ./data/speedgauge.db rows --driver-id 42

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::PathBuf;

use speedgauge_backend::storage::{analytics_store, raw_store};

/// Inspect speed-gauge raw rows and analytics snapshots
#[derive(Parser, Debug)]
#[command(name = "snapshot_inspect")]
#[command(about = "Print stored speed-gauge snapshots and raw rows as JSON")]
struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, env = "SPEEDGAUGE_DB_PATH")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reporting dates present in the raw table
    Dates {
        /// Only dates on or after this day (YYYY-MM-DD)
        #[arg(long)]
        since: Option<NaiveDate>,
    },

    /// Company snapshot for one reporting date
    Company {
        #[arg(long)]
        date: NaiveDate,

        /// Include generated (interpolated) rows
        #[arg(long)]
        generated: bool,
    },

    /// Driver snapshot for one reporting date
    Driver {
        #[arg(long)]
        driver_id: i64,

        #[arg(long)]
        date: NaiveDate,
    },

    /// A driver's raw rows, newest first
    Rows {
        #[arg(long)]
        driver_id: i64,

        /// Only the row for this reporting date
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = Connection::open_with_flags(&cli.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open database: {:?}", cli.db_path))?;

    match cli.command {
        Commands::Dates { since } => {
            let dates = match since {
                Some(day) => raw_store::dates_since(&conn, midnight(day)?)?,
                None => raw_store::distinct_start_dates(&conn)?,
            };
            print_json(&dates)?;
        }
        Commands::Company { date, generated } => {
            match analytics_store::company_snapshot(&conn, midnight(date)?, generated)? {
                Some(snapshot) => print_json(&snapshot)?,
                None => bail!("no company snapshot for {} (generated = {})", date, generated),
            }
        }
        Commands::Driver { driver_id, date } => {
            match analytics_store::driver_snapshot(&conn, driver_id, midnight(date)?)? {
                Some(snapshot) => print_json(&snapshot)?,
                None => bail!("no snapshot for driver {} on {}", driver_id, date),
            }
        }
        Commands::Rows { driver_id, date } => match date {
            Some(day) => {
                let row = raw_store::row_for_driver_on(&conn, driver_id, midnight(day)?)?;
                print_json(&row)?;
            }
            None => print_json(&raw_store::rows_for_driver(&conn, driver_id)?)?,
        },
    }

    Ok(())
}

fn midnight(day: NaiveDate) -> Result<NaiveDateTime> {
    day.and_hms_opt(0, 0, 0)
        .with_context(|| format!("invalid date {}", day))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

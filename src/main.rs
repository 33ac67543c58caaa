//! Speed-gauge engine CLI
//!
//! Usage:
//!   speedgauge ingest
//!   speedgauge reconcile --scope driver
//!   speedgauge reconcile --rebuild
//!   speedgauge run
//!   speedgauge status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use speedgauge_backend::{
    analytics::{planner, ReconcileController, ReconcileReport, ReconcileScope},
    ingest::{IngestProcessor, IngestReport},
    storage::{analytics_store, raw_store},
    EngineConfig, TelemetryDb,
};

/// Speed-gauge telemetry ingestion and rolling analytics
#[derive(Parser, Debug)]
#[command(name = "speedgauge")]
#[command(about = "Ingest speed-gauge exports and reconcile analytics snapshots")]
struct Cli {
    /// TOML config file (defaults to speedgauge.toml when present)
    #[arg(short, long, env = "SPEEDGAUGE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override k in mean ± k·stddev
    #[arg(long)]
    stdev_threshold: Option<f64>,

    /// Override snapshot upserts per commit
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override build worker count
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every export waiting in the unprocessed directory
    Ingest,

    /// Build missing analytics snapshots
    Reconcile {
        #[arg(long, value_enum, default_value_t = ReconcileScope::All)]
        scope: ReconcileScope,

        /// Drop all snapshots first and rebuild from raw rows
        #[arg(long)]
        rebuild: bool,
    },

    /// Ingest, then reconcile everything
    Run,

    /// Row and snapshot counts plus outstanding work
    Status,
}

fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let mut db = TelemetryDb::open(&config.database_path, config.busy_timeout())?;

    match cli.command {
        Command::Ingest => {
            let report = IngestProcessor::new(&mut db, &config).run()?;
            print_ingest(&report);
        }
        Command::Reconcile { scope, rebuild } => {
            let mut controller = ReconcileController::new(&mut db, &config);
            let report = if rebuild {
                controller.rebuild(scope)?
            } else {
                controller.run(scope)?
            };
            print_reconcile(&report);
        }
        Command::Run => {
            let ingest = IngestProcessor::new(&mut db, &config).run()?;
            print_ingest(&ingest);
            let report = ReconcileController::new(&mut db, &config).run(ReconcileScope::All)?;
            print_reconcile(&report);
        }
        Command::Status => print_status(&db)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = EngineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_env();
            config
        }
        None => EngineConfig::from_env(),
    };

    if let Some(path) = &cli.db_path {
        config.database_path = path.clone();
    }
    if let Some(k) = cli.stdev_threshold {
        config.stdev_threshold = k;
    }
    if let Some(n) = cli.batch_size {
        config.batch_size = n.max(1);
    }
    if let Some(n) = cli.workers {
        config.workers = n.max(1);
    }

    info!(
        db = %config.database_path.display(),
        unprocessed = %config.unprocessed_dir.display(),
        stdev_threshold = config.stdev_threshold,
        batch_size = config.batch_size,
        workers = config.workers,
        "⚙️ Engine configured"
    );
    Ok(config)
}

fn print_ingest(report: &IngestReport) {
    println!(
        "ingested {}/{} files: {} inserted, {} updated, {} unchanged, {} skipped rows, {} unresolved drivers",
        report.files_ingested,
        report.files_seen,
        report.rows_inserted,
        report.rows_updated,
        report.rows_unchanged,
        report.rows_skipped,
        report.unresolved_drivers,
    );
    for failed in &report.failed_files {
        // Cause is in the log
        println!("processing error: {}", failed.path.display());
    }
}

fn print_reconcile(report: &ReconcileReport) {
    println!(
        "company snapshots: {} planned, {} written, {} failed",
        report.company.planned, report.company.written, report.company.failed
    );
    println!(
        "driver snapshots:  {} planned, {} written, {} failed",
        report.driver.planned, report.driver.written, report.driver.failed
    );
    if report.cancelled {
        warn!("Run stopped early; re-run reconcile to finish");
        println!("cancelled");
    }
}

fn print_status(db: &TelemetryDb) -> Result<()> {
    let conn = db.conn();
    let dates = raw_store::distinct_start_dates(conn)?;
    let (company, driver) = analytics_store::counts(conn)?;

    println!("raw rows:               {}", raw_store::count(conn)?);
    println!("reporting dates:        {}", dates.len());
    if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
        println!("date range:             {} .. {}", first.date(), last.date());
    }
    println!("company snapshots:      {}", company);
    println!("driver snapshots:       {}", driver);
    println!(
        "missing company keys:   {}",
        planner::missing_company_keys(conn)?.len()
    );
    println!(
        "missing driver keys:    {}",
        planner::missing_driver_keys(conn)?.len()
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speedgauge_backend=info,speedgauge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // cwd + parents
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

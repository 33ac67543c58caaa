//! Batch commit controller
//!
//! Drives planner -> builder -> analytics store for one run:
//! - Filter bounds computed once and shared by every key
//! - One transaction per chunk of `batch_size` keys, one savepoint per key
//! - A failing key rolls back its own savepoint and the run moves on
//! - Cancellation is honored between keys
//!
//! With `workers > 1` and a file-backed database, the read-only build phase
//! of each chunk fans out over a rayon pool; each worker reads through its own
//! connection. Writes always go through the controller's connection.

use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{bounds, builder, planner};
use crate::config::EngineConfig;
use crate::models::{CompanyKey, DriverKey, FilterBounds, SnapshotFields};
use crate::storage::{analytics_store, TelemetryDb};

// =============================================================================
// Snapshot keys
// =============================================================================

/// A unit of reconciliation work: something that can be built from raw rows
/// and stored as a snapshot.
pub trait SnapshotKey: Copy + Send + Sync + fmt::Debug {
    const SCOPE: &'static str;

    fn build(&self, conn: &Connection, bounds: &FilterBounds, window_days: i64)
        -> Result<SnapshotFields>;

    fn store(&self, conn: &Connection, fields: &SnapshotFields) -> Result<()>;
}

impl SnapshotKey for CompanyKey {
    const SCOPE: &'static str = "company";

    fn build(
        &self,
        conn: &Connection,
        bounds: &FilterBounds,
        window_days: i64,
    ) -> Result<SnapshotFields> {
        builder::build_company(conn, self, bounds, window_days)
    }

    fn store(&self, conn: &Connection, fields: &SnapshotFields) -> Result<()> {
        analytics_store::upsert_company(conn, self, fields)
    }
}

impl SnapshotKey for DriverKey {
    const SCOPE: &'static str = "driver";

    fn build(
        &self,
        conn: &Connection,
        bounds: &FilterBounds,
        window_days: i64,
    ) -> Result<SnapshotFields> {
        builder::build_driver(conn, self, bounds, window_days)
    }

    fn store(&self, conn: &Connection, fields: &SnapshotFields) -> Result<()> {
        analytics_store::upsert_driver(conn, self, fields)
    }
}

// =============================================================================
// Run configuration and report
// =============================================================================

/// Which snapshot tables a run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReconcileScope {
    Company,
    Driver,
    All,
}

impl ReconcileScope {
    fn includes_company(&self) -> bool {
        matches!(self, ReconcileScope::Company | ReconcileScope::All)
    }

    fn includes_driver(&self) -> bool {
        matches!(self, ReconcileScope::Driver | ReconcileScope::All)
    }
}

/// Per-scope counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyTally {
    pub planned: usize,
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub bounds: Option<FilterBounds>,
    pub company: KeyTally,
    pub driver: KeyTally,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ReconcileReport {
    pub fn written(&self) -> usize {
        self.company.written + self.driver.written
    }

    pub fn failed(&self) -> usize {
        self.company.failed + self.driver.failed
    }
}

struct RunSettings {
    batch_size: usize,
    window_days: i64,
    busy_timeout: Duration,
    reader_path: Option<PathBuf>,
}

// =============================================================================
// Controller
// =============================================================================

pub struct ReconcileController<'a> {
    db: &'a mut TelemetryDb,
    config: &'a EngineConfig,
    cancel: Arc<AtomicBool>,
}

impl<'a> ReconcileController<'a> {
    pub fn new(db: &'a mut TelemetryDb, config: &'a EngineConfig) -> Self {
        Self {
            db,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned stop flag (e.g. flipped by a signal handler).
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Reconcile `scope` with bounds computed from the current Raw Store.
    pub fn run(&mut self, scope: ReconcileScope) -> Result<ReconcileReport> {
        let bounds = bounds::compute_bounds(self.db.conn(), self.config.stdev_threshold)
            .context("Failed to compute filter bounds")?;
        self.run_with_bounds(scope, bounds)
    }

    /// Drop every snapshot, then reconcile from scratch.
    pub fn rebuild(&mut self, scope: ReconcileScope) -> Result<ReconcileReport> {
        let removed = analytics_store::clear_all(self.db.conn())?;
        info!("🧹 Cleared {} analytics snapshots for rebuild", removed);
        self.run(scope)
    }

    /// Reconcile `scope` using caller-supplied bounds.
    pub fn run_with_bounds(
        &mut self,
        scope: ReconcileScope,
        bounds: FilterBounds,
    ) -> Result<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport {
            bounds: Some(bounds),
            ..Default::default()
        };

        info!(
            ?scope,
            pct_min = bounds.percent_speeding.min,
            pct_max = bounds.percent_speeding.max,
            dist_min = bounds.distance_driven.min,
            dist_max = bounds.distance_driven.max,
            "🔄 Reconciliation started"
        );

        let settings = self.settings();
        let pool = self.build_pool()?;

        if scope.includes_company() {
            let keys = planner::missing_company_keys(self.db.conn())?;
            report.cancelled = process_keys(
                self.db.conn_mut(),
                &keys,
                &bounds,
                &settings,
                pool.as_ref(),
                &self.cancel,
                &mut report.company,
            )?;
        }

        if scope.includes_driver() && !report.cancelled {
            let keys = planner::missing_driver_keys(self.db.conn())?;
            report.cancelled = process_keys(
                self.db.conn_mut(),
                &keys,
                &bounds,
                &settings,
                pool.as_ref(),
                &self.cancel,
                &mut report.driver,
            )?;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.cancelled {
            warn!(
                written = report.written(),
                failed = report.failed(),
                "⏹️ Reconciliation cancelled"
            );
        } else {
            info!(
                company_written = report.company.written,
                driver_written = report.driver.written,
                failed = report.failed(),
                elapsed_ms = report.elapsed_ms,
                "✅ Reconciliation complete"
            );
        }
        Ok(report)
    }

    fn settings(&self) -> RunSettings {
        let reader_path = if self.config.workers > 1 {
            self.db.path().map(Path::to_path_buf)
        } else {
            None
        };
        RunSettings {
            batch_size: self.config.batch_size.max(1),
            window_days: self.config.trend_window_days,
            busy_timeout: self.config.busy_timeout(),
            reader_path,
        }
    }

    fn build_pool(&self) -> Result<Option<rayon::ThreadPool>> {
        if self.config.workers <= 1 || self.db.path().is_none() {
            return Ok(None);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("snapshot-build-{}", i))
            .build()
            .context("Failed to start build workers")?;
        Ok(Some(pool))
    }
}

// =============================================================================
// Chunked processing
// =============================================================================

/// Build and store `keys` in committed chunks. Returns `true` if cancelled.
fn process_keys<K: SnapshotKey>(
    conn: &mut Connection,
    keys: &[K],
    bounds: &FilterBounds,
    settings: &RunSettings,
    pool: Option<&rayon::ThreadPool>,
    cancel: &AtomicBool,
    tally: &mut KeyTally,
) -> Result<bool> {
    tally.planned += keys.len();
    if keys.is_empty() {
        debug!(scope = K::SCOPE, "No missing snapshots");
        return Ok(false);
    }
    info!(scope = K::SCOPE, missing = keys.len(), "📋 Planned snapshot keys");

    let chunk_count = keys.len().div_ceil(settings.batch_size);
    let mut cancelled = false;

    for (chunk_idx, chunk) in keys.chunks(settings.batch_size).enumerate() {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }

        let mut prebuilt = match (pool, settings.reader_path.as_deref()) {
            (Some(pool), Some(path)) => Some(
                build_parallel(pool, path, settings, chunk, bounds).into_iter(),
            ),
            _ => None,
        };

        let mut tx = conn.transaction()?;
        let mut written = 0usize;

        for key in chunk {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let built = match prebuilt.as_mut().and_then(|it| it.next()) {
                Some(result) => result,
                None => key.build(&tx, bounds, settings.window_days),
            };

            let outcome = built.and_then(|fields| {
                let sp = tx.savepoint()?;
                key.store(&sp, &fields)?;
                sp.commit()?;
                Ok(())
            });

            match outcome {
                Ok(()) => written += 1,
                Err(e) => {
                    tally.failed += 1;
                    warn!(scope = K::SCOPE, key = ?key, "Snapshot skipped: {:#}", e);
                }
            }
        }

        let is_final = cancelled || chunk_idx + 1 == chunk_count;
        match tx.commit() {
            Ok(()) => {
                tally.written += written;
                debug!(
                    scope = K::SCOPE,
                    chunk = chunk_idx + 1,
                    of = chunk_count,
                    written,
                    "Chunk committed"
                );
            }
            Err(e) if is_final => {
                return Err(anyhow::Error::new(e).context(format!(
                    "final {} snapshot commit failed; run is incomplete",
                    K::SCOPE
                )));
            }
            Err(e) => {
                tally.failed += written;
                error!(
                    scope = K::SCOPE,
                    chunk = chunk_idx + 1,
                    lost = written,
                    "Chunk commit failed: {}",
                    e
                );
            }
        }

        if cancelled {
            break;
        }
    }

    Ok(cancelled)
}

/// Build a chunk's snapshots on the worker pool, one reader per worker.
fn build_parallel<K: SnapshotKey>(
    pool: &rayon::ThreadPool,
    path: &Path,
    settings: &RunSettings,
    chunk: &[K],
    bounds: &FilterBounds,
) -> Vec<Result<SnapshotFields>> {
    let window_days = settings.window_days;
    let timeout = settings.busy_timeout;
    pool.install(|| {
        chunk
            .par_iter()
            .map_init(
                || TelemetryDb::open_reader(path, timeout),
                |reader, key| match reader {
                    Ok(conn) => key.build(conn, bounds, window_days),
                    Err(e) => Err(anyhow!("build worker has no reader: {:#}", e)),
                },
            )
            .collect()
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricBounds, RawTelemetryRecord};
    use crate::storage::raw_store;
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn make_record(driver_id: Option<i64>, name: &str, start: NaiveDateTime, pct: f64) -> RawTelemetryRecord {
        RawTelemetryRecord {
            driver_id,
            start_date: start,
            end_date: start + chrono::Duration::days(6),
            driver_name: name.to_string(),
            percent_speeding: Some(pct),
            distance_driven: Some(pct * 100.0),
            is_interpolated: Some(false),
            raw_json: format!("{}|{}|{}", name, start, pct),
            ..Default::default()
        }
    }

    fn seed(db: &TelemetryDb) {
        for (i, name) in ["Ann Lee", "Bo Park", "Cy Diaz"].iter().enumerate() {
            for week in 0..4u32 {
                let pct = (i as f64 + 1.0) * 3.0 + week as f64;
                let rec = make_record(Some(i as i64 + 1), name, day(1, 1 + week * 7), pct);
                raw_store::upsert(db.conn(), &rec).unwrap();
            }
        }
    }

    fn small_batches() -> EngineConfig {
        EngineConfig {
            batch_size: 3,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_run_leaves_nothing_missing() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let config = small_batches();

        let report = ReconcileController::new(&mut db, &config)
            .run(ReconcileScope::All)
            .unwrap();

        assert_eq!(report.company.planned, 8);
        assert_eq!(report.company.written, 8);
        assert_eq!(report.driver.written, 12);
        assert_eq!(report.failed(), 0);
        assert!(!report.cancelled);
        assert!(planner::missing_company_keys(db.conn()).unwrap().is_empty());
        assert!(planner::missing_driver_keys(db.conn()).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_reproduces_snapshots() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let config = small_batches();

        ReconcileController::new(&mut db, &config)
            .run(ReconcileScope::All)
            .unwrap();
        let company = analytics_store::all_company_snapshots(db.conn()).unwrap();
        let drivers = analytics_store::all_driver_snapshots(db.conn()).unwrap();

        let report = ReconcileController::new(&mut db, &config)
            .rebuild(ReconcileScope::All)
            .unwrap();
        assert_eq!(report.written(), company.len() + drivers.len());

        assert_eq!(analytics_store::all_company_snapshots(db.conn()).unwrap(), company);
        assert_eq!(analytics_store::all_driver_snapshots(db.conn()).unwrap(), drivers);
    }

    #[test]
    fn test_scope_limits_tables() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let config = small_batches();

        let report = ReconcileController::new(&mut db, &config)
            .run(ReconcileScope::Company)
            .unwrap();
        assert_eq!(report.driver, KeyTally::default());
        assert_eq!(analytics_store::counts(db.conn()).unwrap(), (8, 0));
    }

    #[test]
    fn test_cancel_before_start_writes_nothing() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let config = small_batches();

        let mut controller = ReconcileController::new(&mut db, &config);
        controller.cancel_flag().store(true, Ordering::Relaxed);
        let report = controller.run(ReconcileScope::All).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.written(), 0);
        assert_eq!(report.driver.planned, 0);
        assert_eq!(analytics_store::counts(db.conn()).unwrap(), (0, 0));
    }

    /// Company key wrapper whose build fails on one date.
    #[derive(Debug, Clone, Copy)]
    struct FlakyKey(CompanyKey);

    impl SnapshotKey for FlakyKey {
        const SCOPE: &'static str = "flaky";

        fn build(&self, conn: &Connection, b: &FilterBounds, w: i64) -> Result<SnapshotFields> {
            if self.0.start_date == day(1, 8) {
                return Err(anyhow!("simulated build failure"));
            }
            self.0.build(conn, b, w)
        }

        fn store(&self, conn: &Connection, fields: &SnapshotFields) -> Result<()> {
            self.0.store(conn, fields)
        }
    }

    #[test]
    fn test_failing_key_is_isolated() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let keys: Vec<FlakyKey> = planner::missing_company_keys(db.conn())
            .unwrap()
            .into_iter()
            .map(FlakyKey)
            .collect();
        let bounds = bounds::compute_bounds(db.conn(), 1.0).unwrap();
        let settings = RunSettings {
            batch_size: 3,
            window_days: 365,
            busy_timeout: Duration::from_millis(100),
            reader_path: None,
        };
        let cancel = AtomicBool::new(false);
        let mut tally = KeyTally::default();

        let cancelled = process_keys(
            db.conn_mut(),
            &keys,
            &bounds,
            &settings,
            None,
            &cancel,
            &mut tally,
        )
        .unwrap();

        assert!(!cancelled);
        assert_eq!(tally, KeyTally { planned: 8, written: 6, failed: 2 });
        let missing = planner::missing_company_keys(db.conn()).unwrap();
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|k| k.start_date == day(1, 8)));
    }

    fn one_chunk(batch_size: usize) -> RunSettings {
        RunSettings {
            batch_size,
            window_days: 365,
            busy_timeout: Duration::from_millis(100),
            reader_path: None,
        }
    }

    /// Company key that raises the run's cancel flag once it is stored.
    #[derive(Debug, Clone, Copy)]
    struct StopAfterKey {
        key: CompanyKey,
        stop: &'static AtomicBool,
        last: bool,
    }

    impl SnapshotKey for StopAfterKey {
        const SCOPE: &'static str = "stopping";

        fn build(&self, conn: &Connection, b: &FilterBounds, w: i64) -> Result<SnapshotFields> {
            self.key.build(conn, b, w)
        }

        fn store(&self, conn: &Connection, fields: &SnapshotFields) -> Result<()> {
            self.key.store(conn, fields)?;
            if self.last {
                self.stop.store(true, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    #[test]
    fn test_cancel_mid_chunk_commits_finished_keys() {
        static STOP: AtomicBool = AtomicBool::new(false);

        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        let keys: Vec<StopAfterKey> = planner::missing_company_keys(db.conn())
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, key)| StopAfterKey {
                key,
                stop: &STOP,
                last: i == 2,
            })
            .collect();
        let bounds = bounds::compute_bounds(db.conn(), 1.0).unwrap();
        let mut tally = KeyTally::default();

        let cancelled = process_keys(
            db.conn_mut(),
            &keys,
            &bounds,
            &one_chunk(5),
            None,
            &STOP,
            &mut tally,
        )
        .unwrap();

        assert!(cancelled);
        assert_eq!(tally, KeyTally { planned: 8, written: 3, failed: 0 });
        assert_eq!(analytics_store::counts(db.conn()).unwrap(), (3, 0));
        assert_eq!(planner::missing_company_keys(db.conn()).unwrap().len(), 5);
    }

    #[test]
    fn test_failed_final_commit_is_an_error() {
        let mut db = TelemetryDb::open_memory().unwrap();
        seed(&db);
        // every stored company snapshot leaves an orphan row checked at COMMIT
        db.conn()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE audit_parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE audit_child (
                     parent_id INTEGER REFERENCES audit_parent(id)
                         DEFERRABLE INITIALLY DEFERRED
                 );
                 CREATE TRIGGER orphan_audit AFTER INSERT ON company_analytics
                 BEGIN INSERT INTO audit_child VALUES (999); END;",
            )
            .unwrap();

        let keys = planner::missing_company_keys(db.conn()).unwrap();
        let bounds = bounds::compute_bounds(db.conn(), 1.0).unwrap();
        let cancel = AtomicBool::new(false);
        let mut tally = KeyTally::default();

        let err = process_keys(
            db.conn_mut(),
            &keys,
            &bounds,
            &one_chunk(keys.len()),
            None,
            &cancel,
            &mut tally,
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("final company snapshot commit failed"));
        assert_eq!(tally.written, 0);
        assert_eq!(analytics_store::counts(db.conn()).unwrap(), (0, 0));
    }

    #[test]
    fn test_parallel_build_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sg.db");
        let mut db = TelemetryDb::open(&path, Duration::from_secs(5)).unwrap();
        seed(&db);

        let sequential = small_batches();
        ReconcileController::new(&mut db, &sequential)
            .run(ReconcileScope::All)
            .unwrap();
        let expected = analytics_store::all_driver_snapshots(db.conn()).unwrap();

        let parallel = EngineConfig {
            workers: 3,
            ..small_batches()
        };
        let report = ReconcileController::new(&mut db, &parallel)
            .rebuild(ReconcileScope::All)
            .unwrap();
        assert_eq!(report.failed(), 0);
        assert_eq!(analytics_store::all_driver_snapshots(db.conn()).unwrap(), expected);
    }

    #[test]
    fn test_unresolved_and_outlier_rows() {
        let mut db = TelemetryDb::open_memory().unwrap();
        let d = day(1, 1);
        raw_store::upsert(db.conn(), &make_record(None, "Jane Doe", d, 5.0)).unwrap();
        raw_store::upsert(db.conn(), &make_record(Some(42), "Al Smith", d, 95.0)).unwrap();

        let bounds = FilterBounds {
            stdev_threshold: 1.0,
            percent_speeding: MetricBounds { min: 0.0, max: 50.0 },
            distance_driven: MetricBounds { min: 0.0, max: 100_000.0 },
        };
        let config = EngineConfig::default();
        let report = ReconcileController::new(&mut db, &config)
            .run_with_bounds(ReconcileScope::All, bounds)
            .unwrap();
        assert_eq!(report.company.written, 2);
        // Jane has no driver id, so only Al gets a driver snapshot
        assert_eq!(report.driver.written, 1);

        let snap = analytics_store::company_snapshot(db.conn(), d, false)
            .unwrap()
            .unwrap();
        assert_eq!(snap.fields.records_count, 2);
        assert_eq!(snap.fields.percent_speeding.count, 1);
        assert_eq!(snap.fields.percent_speeding.avg, Some(5.0));
        assert_eq!(snap.fields.percent_speeding.median, Some(5.0));
        assert_eq!(snap.fields.stdev_threshold, 1.0);
    }
}

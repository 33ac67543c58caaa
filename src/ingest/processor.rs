//! Ingestion driver: unprocessed directory -> raw table -> processed directory
//!
//! Each file is parsed, identity-resolved and upserted inside one transaction.
//! Snapshots made stale by new or changed rows are dropped in the same
//! transaction. Only after commit are newly learned driver identities saved
//! and the file renamed into the processed directory; a failed file stays
//! where it is so a later run retries it.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use super::identity::{DriverDirectory, IdentityResolver, Resolution};
use super::normalizer;
use crate::config::EngineConfig;
use crate::storage::{analytics_store, raw_store, TelemetryDb, UpsertOutcome};

/// An export that could not be ingested.
#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_ingested: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_unchanged: usize,
    pub rows_skipped: usize,
    pub unresolved_drivers: usize,
    pub snapshots_invalidated: usize,
    pub failed_files: Vec<FailedFile>,
    pub elapsed_ms: u64,
}

/// Outcome of ingesting a single file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub unresolved: usize,
    pub invalidated: usize,
}

pub struct IngestProcessor<'a> {
    db: &'a mut TelemetryDb,
    config: &'a EngineConfig,
    resolver: IdentityResolver,
}

impl<'a> IngestProcessor<'a> {
    pub fn new(db: &'a mut TelemetryDb, config: &'a EngineConfig) -> Self {
        let directory = DriverDirectory::load(&config.driver_directory_path);
        Self::with_resolver(db, config, IdentityResolver::new(directory))
    }

    pub fn with_resolver(
        db: &'a mut TelemetryDb,
        config: &'a EngineConfig,
        resolver: IdentityResolver,
    ) -> Self {
        Self {
            db,
            config,
            resolver,
        }
    }

    /// Regular files in the unprocessed directory, sorted by name.
    pub fn find_unprocessed_files(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.unprocessed_dir;
        if !dir.exists() {
            warn!(dir = %dir.display(), "Unprocessed directory does not exist");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Ingest every pending export. Per-file failures are reported, not returned.
    pub fn run(&mut self) -> Result<IngestReport> {
        let started = Instant::now();
        let files = self.find_unprocessed_files()?;
        let mut report = IngestReport {
            files_seen: files.len(),
            ..Default::default()
        };

        if files.is_empty() {
            info!("📭 No exports waiting in {}", self.config.unprocessed_dir.display());
        }

        for path in files {
            match self.ingest_file(&path) {
                Ok(outcome) => {
                    report.files_ingested += 1;
                    report.rows_inserted += outcome.inserted;
                    report.rows_updated += outcome.updated;
                    report.rows_unchanged += outcome.unchanged;
                    report.rows_skipped += outcome.skipped;
                    report.unresolved_drivers += outcome.unresolved;
                    report.snapshots_invalidated += outcome.invalidated;
                }
                Err(e) => {
                    error!(file = %path.display(), "Export not ingested: {:#}", e);
                    report.failed_files.push(FailedFile {
                        path,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            ingested = report.files_ingested,
            failed = report.failed_files.len(),
            inserted = report.rows_inserted,
            updated = report.rows_updated,
            unchanged = report.rows_unchanged,
            "📥 Ingestion complete"
        );
        Ok(report)
    }

    /// Parse, upsert and archive one export. Nothing is written on error.
    pub fn ingest_file(&mut self, path: &Path) -> Result<FileOutcome> {
        let result = self.ingest_and_archive(path);
        if result.is_err() {
            self.resolver.discard_pending();
        }
        result
    }

    fn ingest_and_archive(&mut self, path: &Path) -> Result<FileOutcome> {
        let parsed = normalizer::parse_report(path)?;
        let window_days = self.config.trend_window_days;

        let mut outcome = FileOutcome {
            skipped: parsed.skipped_rows,
            ..Default::default()
        };

        let tx = self.db.conn_mut().transaction()?;
        for mut record in parsed.records {
            if self.resolver.apply(&mut record) == Resolution::Unresolved {
                outcome.unresolved += 1;
            }

            let upserted = raw_store::upsert(&tx, &record)?;
            match upserted {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::Updated => outcome.updated += 1,
                UpsertOutcome::Unchanged => outcome.unchanged += 1,
            }
            if upserted.changed() {
                outcome.invalidated += analytics_store::invalidate_from(
                    &tx,
                    record.driver_id,
                    record.start_date,
                    window_days,
                )?;
            }
        }
        tx.commit()
            .with_context(|| format!("Failed to commit rows from {}", parsed.source))?;
        self.resolver.commit_directory();

        let dest = self.move_to_processed(path)?;
        info!(
            file = %parsed.source,
            period = %format!("{}..{}", parsed.start_date.date(), parsed.end_date.date()),
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            moved_to = %dest.display(),
            "✅ Export ingested"
        );
        Ok(outcome)
    }

    /// Rename only: a file is never visible in both directories. If the
    /// rename fails the file stays unprocessed and re-ingesting it is a no-op.
    fn move_to_processed(&self, path: &Path) -> Result<PathBuf> {
        let dir = &self.config.processed_dir;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let file_name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?;
        let dest = dir.join(file_name);

        fs::rename(path, &dest)
            .with_context(|| format!("Failed to move {} to {}", path.display(), dest.display()))?;
        Ok(dest)
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestError;
    use crate::models::DriverIdentity;

    const EXPORT: &str = "\
Driver Name,Driver ID,Percent Speeding,Distance Driven
Jane Doe,,5.0,1200
Al Smith,42,95.0,900
Median,,50,1050
---
footer
footer
Monday, January 1, 2024, 00:00 - Sunday, January 7, 2024, 23:59
";

    fn make_config(root: &Path) -> EngineConfig {
        EngineConfig {
            database_path: root.join("sg.db"),
            unprocessed_dir: root.join("unprocessed"),
            processed_dir: root.join("processed"),
            driver_directory_path: root.join("drivers.json"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_ingest_moves_file_and_resolves_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let config = make_config(tmp.path());
        fs::create_dir_all(&config.unprocessed_dir).unwrap();
        fs::write(config.unprocessed_dir.join("week1.csv"), EXPORT).unwrap();

        let mut db = TelemetryDb::open_memory().unwrap();
        let directory = DriverDirectory::in_memory(vec![DriverIdentity {
            driver_id: 7,
            first_name: "jane".into(),
            last_name: "doe".into(),
        }]);
        let mut processor =
            IngestProcessor::with_resolver(&mut db, &config, IdentityResolver::new(directory));
        let report = processor.run().unwrap();

        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.rows_inserted, 2);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.unresolved_drivers, 0);
        assert!(config.processed_dir.join("week1.csv").exists());
        assert!(!config.unprocessed_dir.join("week1.csv").exists());
        assert_eq!(processor.resolver().directory().len(), 2);

        let jane = raw_store::rows_for_driver(db.conn(), 7).unwrap();
        assert_eq!(jane.len(), 1);
        assert_eq!(jane[0].percent_speeding, Some(5.0));
    }

    #[test]
    fn test_malformed_file_stays_put() {
        let tmp = tempfile::tempdir().unwrap();
        let config = make_config(tmp.path());
        fs::create_dir_all(&config.unprocessed_dir).unwrap();
        let bad = config.unprocessed_dir.join("a_bad.csv");
        fs::write(&bad, "Driver Name,Percent Speeding\nJane Doe,5\n").unwrap();
        fs::write(config.unprocessed_dir.join("b_good.csv"), EXPORT).unwrap();

        let mut db = TelemetryDb::open_memory().unwrap();
        let report = IngestProcessor::new(&mut db, &config).run().unwrap();

        assert_eq!(report.files_seen, 2);
        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.failed_files.len(), 1);
        assert_eq!(report.failed_files[0].path, bad);
        assert!(bad.exists());
        assert_eq!(raw_store::count(db.conn()).unwrap(), 2);

        let err = normalizer::parse_report(&bad).unwrap_err();
        assert!(err.downcast_ref::<IngestError>().is_some());
    }

    #[test]
    fn test_changed_row_drops_dependent_snapshots() {
        use crate::models::{CompanyKey, SnapshotFields};

        let tmp = tempfile::tempdir().unwrap();
        let config = make_config(tmp.path());
        fs::create_dir_all(&config.unprocessed_dir).unwrap();
        let mut db = TelemetryDb::open_memory().unwrap();

        fs::write(config.unprocessed_dir.join("week1.csv"), EXPORT).unwrap();
        IngestProcessor::new(&mut db, &config).run().unwrap();

        let start = raw_store::distinct_start_dates(db.conn()).unwrap()[0];
        let key = CompanyKey {
            start_date: start,
            generated_allowed: true,
        };
        analytics_store::upsert_company(db.conn(), &key, &SnapshotFields::default()).unwrap();

        // Same file again: nothing changes, snapshot survives
        fs::write(config.unprocessed_dir.join("week1.csv"), EXPORT).unwrap();
        let report = IngestProcessor::new(&mut db, &config).run().unwrap();
        assert_eq!(report.rows_unchanged, 2);
        assert_eq!(report.snapshots_invalidated, 0);
        assert_eq!(raw_store::count(db.conn()).unwrap(), 2);

        // Corrected export: Al's value changes, the snapshot is stale
        fs::write(
            config.unprocessed_dir.join("week1_fixed.csv"),
            EXPORT.replace("95.0", "45.0"),
        )
        .unwrap();
        let report = IngestProcessor::new(&mut db, &config).run().unwrap();
        assert_eq!(report.rows_updated, 1);
        assert_eq!(report.snapshots_invalidated, 1);
        assert!(analytics_store::company_keys(db.conn()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_move_leaves_file_unprocessed_only() {
        let tmp = tempfile::tempdir().unwrap();
        let config = make_config(tmp.path());
        fs::create_dir_all(&config.unprocessed_dir).unwrap();
        let src = config.unprocessed_dir.join("week1.csv");
        fs::write(&src, EXPORT).unwrap();
        // a non-empty directory where the archived file would go
        let blocked = config.processed_dir.join("week1.csv");
        fs::create_dir_all(blocked.join("inner")).unwrap();

        let mut db = TelemetryDb::open_memory().unwrap();
        let report = IngestProcessor::new(&mut db, &config).run().unwrap();
        assert_eq!(report.files_ingested, 0);
        assert_eq!(report.failed_files.len(), 1);
        assert!(src.exists());
        assert!(blocked.is_dir());
        assert_eq!(raw_store::count(db.conn()).unwrap(), 2);

        fs::remove_dir_all(&blocked).unwrap();
        let retry = IngestProcessor::new(&mut db, &config).run().unwrap();
        assert_eq!(retry.files_ingested, 1);
        assert_eq!(retry.rows_unchanged, 2);
        assert!(!src.exists());
        assert!(blocked.is_file());
    }

    #[test]
    fn test_directory_saved_only_after_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let config = make_config(tmp.path());
        fs::create_dir_all(&config.unprocessed_dir).unwrap();
        fs::write(config.unprocessed_dir.join("week1.csv"), EXPORT).unwrap();

        let mut db = TelemetryDb::open_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_al BEFORE INSERT ON speedgauge_data
                 WHEN NEW.driver_name = 'Al Smith'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        {
            let mut processor = IngestProcessor::new(&mut db, &config);
            let report = processor.run().unwrap();
            assert_eq!(report.failed_files.len(), 1);
            assert!(processor.resolver().directory().is_empty());
        }
        assert!(!config.driver_directory_path.exists());

        db.conn().execute_batch("DROP TRIGGER reject_al;").unwrap();
        let report = IngestProcessor::new(&mut db, &config).run().unwrap();
        assert_eq!(report.files_ingested, 1);
        let saved = DriverDirectory::load(&config.driver_directory_path);
        assert_eq!(saved.resolve(Some("al"), Some("smith")), Some(42));
    }
}

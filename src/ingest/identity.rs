//! Driver identity directory (`drivers.json`)
//!
//! Exports sometimes omit driver ids. The directory remembers every
//! `(id, first, last)` seen on rows that did carry one, and fills the gap on
//! rows that don't. New entries stay pending until the export that taught
//! them commits, then the file is written once. Directory I/O problems are
//! logged and never stop ingestion.

use anyhow::{Context, Result};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::{DriverIdentity, RawTelemetryRecord};

/// Name-keyed lookup of known drivers.
#[derive(Debug, Clone, Default)]
pub struct DriverDirectory {
    path: Option<PathBuf>,
    entries: Vec<DriverIdentity>,
    /// Entries before this index are on disk
    saved: usize,
}

impl DriverDirectory {
    /// Load the directory file. A missing or unreadable file yields an empty
    /// directory that will still persist to `path` once it learns an entry.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<DriverIdentity>>(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), "Driver directory unreadable: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No driver directory yet");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), "Driver directory unavailable: {}", e);
                Vec::new()
            }
        };
        Self {
            path: Some(path),
            saved: entries.len(),
            entries,
        }
    }

    /// Directory that lives only in memory (for testing).
    pub fn in_memory(entries: Vec<DriverIdentity>) -> Self {
        Self {
            path: None,
            saved: entries.len(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DriverIdentity] {
        &self.entries
    }

    /// Exact, case-insensitive match on both names.
    pub fn resolve(&self, first_name: Option<&str>, last_name: Option<&str>) -> Option<i64> {
        let first = first_name?.to_lowercase();
        let last = last_name?.to_lowercase();
        self.entries
            .iter()
            .find(|d| d.first_name.to_lowercase() == first && d.last_name.to_lowercase() == last)
            .map(|d| d.driver_id)
    }

    /// Remember `identity` if its id is new. Returns whether it was added.
    /// The entry is pending until [`save`](Self::save).
    pub fn observe(&mut self, identity: DriverIdentity) -> bool {
        if self.entries.iter().any(|d| d.driver_id == identity.driver_id) {
            return false;
        }
        debug!(
            driver_id = identity.driver_id,
            "New driver {} {} pending", identity.first_name, identity.last_name
        );
        self.entries.push(identity);
        true
    }

    pub fn pending(&self) -> usize {
        self.entries.len() - self.saved
    }

    /// Write pending entries, if any.
    pub fn save(&mut self) -> Result<()> {
        if self.pending() == 0 {
            return Ok(());
        }
        self.persist()?;
        info!(
            added = self.pending(),
            total = self.entries.len(),
            "👤 Driver directory updated"
        );
        self.saved = self.entries.len();
        Ok(())
    }

    /// Forget entries learned since the last save.
    pub fn discard_pending(&mut self) {
        if self.pending() > 0 {
            debug!(dropped = self.pending(), "Pending driver entries discarded");
            self.entries.truncate(self.saved);
        }
    }

    /// Write to a sibling temp file, then rename over the original.
    fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// What the resolver did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Row carried its own id
    Provided,
    /// Id filled in from the directory
    Resolved(i64),
    /// No id available; stored with a null driver id
    Unresolved,
}

/// Fills missing driver ids and teaches the directory new ones.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    directory: DriverDirectory,
}

impl IdentityResolver {
    pub fn new(directory: DriverDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &DriverDirectory {
        &self.directory
    }

    /// Persist what the last export taught. Failure is logged only.
    pub fn commit_directory(&mut self) {
        if let Err(e) = self.directory.save() {
            warn!("Driver directory not saved: {:#}", e);
        }
    }

    pub fn discard_pending(&mut self) {
        self.directory.discard_pending();
    }

    pub fn apply(&mut self, record: &mut RawTelemetryRecord) -> Resolution {
        if let Some(driver_id) = record.driver_id {
            if let (Some(first), Some(last)) = (&record.first_name, &record.last_name) {
                self.directory.observe(DriverIdentity {
                    driver_id,
                    first_name: first.clone(),
                    last_name: last.clone(),
                });
            }
            return Resolution::Provided;
        }

        match self
            .directory
            .resolve(record.first_name.as_deref(), record.last_name.as_deref())
        {
            Some(driver_id) => {
                record.driver_id = Some(driver_id);
                record.set_raw_field("driver_id", json!(driver_id));
                Resolution::Resolved(driver_id)
            }
            None => {
                debug!(name = %record.driver_name, "Driver id unresolved");
                Resolution::Unresolved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_identity(id: i64, first: &str, last: &str) -> DriverIdentity {
        DriverIdentity {
            driver_id: id,
            first_name: first.to_string(),
            last_name: last.to_string(),
        }
    }

    fn make_record(id: Option<i64>, first: Option<&str>, last: Option<&str>) -> RawTelemetryRecord {
        RawTelemetryRecord {
            driver_id: id,
            driver_name: "x".to_string(),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            raw_json: r#"{"driver_id":null}"#.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive_and_needs_both_names() {
        let dir = DriverDirectory::in_memory(vec![make_identity(7, "Jane", "Doe")]);
        assert_eq!(dir.resolve(Some("JANE"), Some("doe")), Some(7));
        assert_eq!(dir.resolve(Some("Jane"), None), None);
        assert_eq!(dir.resolve(Some("Jane"), Some("Smith")), None);
    }

    #[test]
    fn test_apply_fills_missing_id() {
        let mut resolver =
            IdentityResolver::new(DriverDirectory::in_memory(vec![make_identity(7, "Jane", "Doe")]));
        let mut rec = make_record(None, Some("Jane"), Some("Doe"));

        assert_eq!(resolver.apply(&mut rec), Resolution::Resolved(7));
        assert_eq!(rec.driver_id, Some(7));
        assert_eq!(rec.raw_json, r#"{"driver_id":7}"#);

        let mut stranger = make_record(None, Some("Al"), Some("Smith"));
        assert_eq!(resolver.apply(&mut stranger), Resolution::Unresolved);
        assert_eq!(stranger.driver_id, None);
    }

    #[test]
    fn test_observe_persists_new_ids_on_save() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db").join("drivers.json");

        let mut dir = DriverDirectory::load(&path);
        assert!(dir.is_empty());
        assert!(dir.observe(make_identity(42, "Al", "Smith")));
        assert!(!dir.observe(make_identity(42, "Albert", "Smith")));
        assert!(dir.observe(make_identity(43, "Bo", "Park")));
        assert_eq!(dir.pending(), 2);
        assert!(!path.exists());

        dir.save().unwrap();
        assert_eq!(dir.pending(), 0);
        let reloaded = DriverDirectory::load(&path);
        assert_eq!(
            reloaded.entries(),
            &[make_identity(42, "Al", "Smith"), make_identity(43, "Bo", "Park")]
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_discard_drops_unsaved_entries_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drivers.json");

        let mut dir = DriverDirectory::load(&path);
        dir.observe(make_identity(1, "Ann", "Lee"));
        dir.save().unwrap();
        dir.observe(make_identity(2, "Cy", "Diaz"));
        dir.discard_pending();

        assert_eq!(dir.entries(), &[make_identity(1, "Ann", "Lee")]);
        assert_eq!(dir.resolve(Some("Cy"), Some("Diaz")), None);
        assert_eq!(DriverDirectory::load(&path).len(), 1);
    }

    #[test]
    fn test_apply_learns_from_rows_with_ids() {
        let mut resolver = IdentityResolver::default();
        let mut al = make_record(Some(42), Some("Al"), Some("Smith"));
        assert_eq!(resolver.apply(&mut al), Resolution::Provided);
        assert_eq!(resolver.directory().len(), 1);

        let mut later = make_record(None, Some("al"), Some("SMITH"));
        assert_eq!(resolver.apply(&mut later), Resolution::Resolved(42));
    }

    #[test]
    fn test_corrupt_directory_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drivers.json");
        fs::write(&path, "{not json").unwrap();
        assert!(DriverDirectory::load(&path).is_empty());
    }
}

//! Engine configuration
//!
//! Paths, filter threshold, and batching knobs. Loaded from a TOML file and
//! then overridden by `SPEEDGAUGE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by ingestion and reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database holding raw rows and analytics snapshots
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Holding area for exports waiting to be ingested
    #[serde(default = "default_unprocessed_dir")]
    pub unprocessed_dir: PathBuf,

    /// Exports are moved here once their rows are committed
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,

    /// Flat JSON list of known driver identities
    #[serde(default = "default_driver_directory_path")]
    pub driver_directory_path: PathBuf,

    /// k in `mean ± k·stddev`
    #[serde(default = "default_stdev_threshold")]
    pub stdev_threshold: f64,

    /// Snapshot upserts per committed transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads for the read-only build phase (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a statement waits on a locked database (ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Trailing window for driver stats and trend series (days)
    #[serde(default = "default_trend_window_days")]
    pub trend_window_days: i64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/speedgauge.db")
}

fn default_unprocessed_dir() -> PathBuf {
    PathBuf::from("data/unprocessed")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("data/processed")
}

fn default_driver_directory_path() -> PathBuf {
    PathBuf::from("data/drivers.json")
}

fn default_stdev_threshold() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_trend_window_days() -> i64 {
    365
}

/// Longest trailing window accepted (about a century).
const MAX_TREND_WINDOW_DAYS: i64 = 36_500;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            unprocessed_dir: default_unprocessed_dir(),
            processed_dir: default_processed_dir(),
            driver_directory_path: default_driver_directory_path(),
            stdev_threshold: default_stdev_threshold(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            busy_timeout_ms: default_busy_timeout_ms(),
            trend_window_days: default_trend_window_days(),
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config.sanitized())
    }

    /// Load the file named by `SPEEDGAUGE_CONFIG` (or `speedgauge.toml`), falling
    /// back to defaults, then apply environment overrides.
    pub fn from_env() -> Self {
        let path = std::env::var("SPEEDGAUGE_CONFIG")
            .unwrap_or_else(|_| "speedgauge.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SPEEDGAUGE_DB_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPEEDGAUGE_UNPROCESSED_DIR") {
            self.unprocessed_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPEEDGAUGE_PROCESSED_DIR") {
            self.processed_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPEEDGAUGE_DRIVERS_JSON") {
            self.driver_directory_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<f64>("SPEEDGAUGE_STDEV_THRESHOLD") {
            self.stdev_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("SPEEDGAUGE_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse::<usize>("SPEEDGAUGE_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse::<u64>("SPEEDGAUGE_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = v;
        }
        *self = self.clone().sanitized();
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Clamp values that would stall or misbehave at runtime.
    fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = default_batch_size();
        }
        if self.workers == 0 {
            self.workers = 1;
        }
        if !self.stdev_threshold.is_finite() || self.stdev_threshold < 0.0 {
            self.stdev_threshold = default_stdev_threshold();
        }
        if self.trend_window_days <= 0 {
            self.trend_window_days = default_trend_window_days();
        }
        self.trend_window_days = self.trend_window_days.min(MAX_TREND_WINDOW_DAYS);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

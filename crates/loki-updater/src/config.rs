//! Updater configuration
//!
//! Loaded from the environment (after an optional `.env` file) with a
//! `DEFAULT_*` fallback for every knob, then validated.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATABASE_PATH: &str = "loki.db";
pub const DEFAULT_WORK_DIR: &str = "./loki-cache";
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_DOWNLOAD_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DOWNLOAD_RETRY_DELAY_SECS: u64 = 5;
/// Fraction of a region that must be covered by one chain to lift it
pub const DEFAULT_LIFTOVER_MIN_COVERAGE: f64 = 0.95;
pub const DEFAULT_LIFTOVER_BATCH_SIZE: i64 = 2500;
pub const DEFAULT_ZONE_SIZE: i64 = 100_000;

/// In-memory database path accepted by [`crate::db::Store::open`]
pub const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// SQLite file backing the knowledge store, or `:memory:`
    pub database_path: String,
    /// Refuse every mutating operation
    pub read_only: bool,
    /// Root of the per-source download cache
    pub work_dir: PathBuf,
    /// Keep downloaded files after a run so later runs can skip downloading
    pub keep_downloads: bool,
    pub download_concurrency: usize,
    pub download_max_attempts: u32,
    pub download_retry_delay_secs: u64,
    pub liftover_min_coverage: f64,
    pub liftover_batch_size: i64,
    /// Switch the store into bulk-write mode (relaxed durability, indexes dropped) during loads
    pub bulk_mode: bool,
    pub zone_size: i64,
    /// Tables purged first, in this order, before the dependency-sorted rest
    pub purge_overrides: Vec<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            read_only: false,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            keep_downloads: true,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            download_max_attempts: DEFAULT_DOWNLOAD_MAX_ATTEMPTS,
            download_retry_delay_secs: DEFAULT_DOWNLOAD_RETRY_DELAY_SECS,
            liftover_min_coverage: DEFAULT_LIFTOVER_MIN_COVERAGE,
            liftover_batch_size: DEFAULT_LIFTOVER_BATCH_SIZE,
            bulk_mode: true,
            zone_size: DEFAULT_ZONE_SIZE,
            purge_overrides: Vec::new(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl UpdaterConfig {
    /// Read `.env` if present, then the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Environment variables:
    /// - `LOKI_DATABASE_PATH`, `LOKI_READ_ONLY`
    /// - `LOKI_WORK_DIR`, `LOKI_KEEP_DOWNLOADS`
    /// - `DOWNLOAD_CONCURRENCY`, `DOWNLOAD_MAX_ATTEMPTS`, `DOWNLOAD_RETRY_DELAY_SECS`
    /// - `LIFTOVER_MIN_COVERAGE`, `LIFTOVER_BATCH_SIZE`
    /// - `LOKI_BULK_MODE`, `LOKI_ZONE_SIZE`
    /// - `PURGE_OVERRIDES` (comma-separated table names)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_path: std::env::var("LOKI_DATABASE_PATH")
                .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string()),
            read_only: env_or("LOKI_READ_ONLY", defaults.read_only),
            work_dir: std::env::var("LOKI_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            keep_downloads: env_or("LOKI_KEEP_DOWNLOADS", defaults.keep_downloads),
            download_concurrency: env_or("DOWNLOAD_CONCURRENCY", DEFAULT_DOWNLOAD_CONCURRENCY),
            download_max_attempts: env_or("DOWNLOAD_MAX_ATTEMPTS", DEFAULT_DOWNLOAD_MAX_ATTEMPTS),
            download_retry_delay_secs: env_or(
                "DOWNLOAD_RETRY_DELAY_SECS",
                DEFAULT_DOWNLOAD_RETRY_DELAY_SECS,
            ),
            liftover_min_coverage: env_or("LIFTOVER_MIN_COVERAGE", DEFAULT_LIFTOVER_MIN_COVERAGE),
            liftover_batch_size: env_or("LIFTOVER_BATCH_SIZE", DEFAULT_LIFTOVER_BATCH_SIZE),
            bulk_mode: env_or("LOKI_BULK_MODE", defaults.bulk_mode),
            zone_size: env_or("LOKI_ZONE_SIZE", DEFAULT_ZONE_SIZE),
            purge_overrides: std::env::var("PURGE_OVERRIDES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// In-memory store with a throwaway work directory; used by tests and dry runs
    pub fn in_memory(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_path: MEMORY_DATABASE.to_string(),
            work_dir: work_dir.into(),
            download_retry_delay_secs: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_path.trim().is_empty() {
            anyhow::bail!("LOKI_DATABASE_PATH must not be empty");
        }
        if self.download_concurrency == 0 {
            anyhow::bail!("DOWNLOAD_CONCURRENCY must be greater than 0");
        }
        if self.download_max_attempts == 0 {
            anyhow::bail!("DOWNLOAD_MAX_ATTEMPTS must be at least 1");
        }
        if !(self.liftover_min_coverage > 0.0 && self.liftover_min_coverage <= 1.0) {
            anyhow::bail!(
                "LIFTOVER_MIN_COVERAGE must be in (0, 1], got {}",
                self.liftover_min_coverage
            );
        }
        if self.liftover_batch_size <= 0 {
            anyhow::bail!("LIFTOVER_BATCH_SIZE must be greater than 0");
        }
        if self.zone_size <= 0 {
            anyhow::bail!("LOKI_ZONE_SIZE must be greater than 0");
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.download_retry_delay_secs)
    }

    pub fn is_memory(&self) -> bool {
        self.database_path == MEMORY_DATABASE
    }
}

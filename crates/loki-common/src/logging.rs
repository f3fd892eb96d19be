//! Subscriber setup for LOKI binaries
//!
//! Console lines go to stderr so command output on stdout stays clean. When
//! a log directory is configured, the same events are also written to a
//! daily-rotated file. Library code only uses the `tracing` macros:
//!
//! ```rust,ignore
//! info!(source = %name, rows = deleted, "purged source rows");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use loki_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("updater started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// JSON lines instead of human-readable text
    pub json: bool,
    /// Also write daily-rotated files here
    pub log_dir: Option<PathBuf>,
    /// File name prefix, e.g. `loki-updater` -> `loki-updater.2024-01-18`
    pub log_file_prefix: String,
    /// Extra directives such as `sqlx=warn,loki_updater::liftover=debug`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            log_dir: None,
            log_file_prefix: "loki".to_string(),
            filter: None,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by `LOKI_LOG_LEVEL`, `LOKI_LOG_JSON`,
    /// `LOKI_LOG_DIR` and `LOKI_LOG_FILTER`
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    pub fn merge_env(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("LOKI_LOG_LEVEL") {
            self.level = level
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid LOKI_LOG_LEVEL: {level}"))?;
        }
        if let Ok(json) = std::env::var("LOKI_LOG_JSON") {
            self.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(dir) = std::env::var("LOKI_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Ok(filter) = std::env::var("LOKI_LOG_FILTER") {
            self.filter = Some(filter);
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in self
            .filter
            .iter()
            .flat_map(|f| f.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Bad log filter directive '{directive}'"))?,
            );
        }
        Ok(filter)
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
        if self.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.config.json = json;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Flushes the file writer when dropped
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Call once, at startup.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = vec![config.layer(std::io::stderr, true)];
    let mut file_guard = None;

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(config.layer(writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard { _file: file_guard })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = LogConfig::builder()
            .level(Level::DEBUG)
            .json(true)
            .log_file_prefix("loki-updater")
            .filter("sqlx=warn, loki_updater=trace")
            .build();

        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json);
        assert!(config.log_dir.is_none());
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_bad_filter_directive_is_reported() {
        let config = LogConfig::builder().filter("sqlx=loud").build();
        assert!(config.env_filter().is_err());
    }
}

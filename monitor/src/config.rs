//! Configuration module for the event monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `EVENT_MONITOR_DIR` | Yes | - | Directory holding `event_*.log` files |
//! | `EVENT_MONITOR_SCAN_INTERVAL_MS` | No | 2000 | Milliseconds between scans |
//! | `EVENT_MONITOR_LINE_LENGTH_LIMIT` | No | 2097152 | Longest accepted line in bytes |
//! | `EVENT_MONITOR_LINE_COUNT_LIMIT` | No | 200 | Lines read per file per scan |
//! | `EVENT_MONITOR_SOURCE_TYPES` | No | (all) | Comma-separated source types to follow |
//! | `EVENT_MONITOR_FAILURE_WARN_THRESHOLD` | No | 5 | Consecutive failed scans before an error is logged |
//!
//! # Example
//!
//! ```no_run
//! use event_monitor::config::MonitorConfig;
//!
//! let config = MonitorConfig::from_env().expect("Failed to load configuration");
//! println!("Watching: {}", config.event_dir.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Default scan interval in milliseconds.
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 2000;

/// Default maximum line length in bytes (2 MiB).
pub const DEFAULT_LINE_LENGTH_LIMIT: usize = 2 * 1024 * 1024;

/// Default number of lines read per file per scan.
pub const DEFAULT_LINE_COUNT_LIMIT: usize = 200;

/// Default number of consecutive failed scans before an error is logged.
pub const DEFAULT_FAILURE_WARN_THRESHOLD: u32 = 5;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for one monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directory scanned for `event_<SOURCE_TYPE>.log` files.
    pub event_dir: PathBuf,

    /// Delay between the end of one scan and the start of the next.
    pub scan_interval: Duration,

    /// Lines longer than this many bytes (newline excluded) are dropped.
    pub line_length_limit: usize,

    /// Maximum lines read from one file in one scan.
    pub line_count_limit: usize,

    /// Optional allowlist of source types. If `None`, all sources are followed.
    pub source_types: Option<Vec<String>>,

    /// Consecutive directory listing failures before an error is logged.
    pub failure_warn_threshold: u32,

    /// Files whose modification time is not after this instant are skipped.
    pub start_mtime: Option<SystemTime>,
}

impl MonitorConfig {
    /// Creates a configuration with default limits for `event_dir`.
    pub fn new(event_dir: impl Into<PathBuf>) -> Self {
        Self {
            event_dir: event_dir.into(),
            scan_interval: Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS),
            line_length_limit: DEFAULT_LINE_LENGTH_LIMIT,
            line_count_limit: DEFAULT_LINE_COUNT_LIMIT,
            source_types: None,
            failure_warn_threshold: DEFAULT_FAILURE_WARN_THRESHOLD,
            start_mtime: None,
        }
    }

    #[must_use]
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    #[must_use]
    pub fn with_line_length_limit(mut self, limit: usize) -> Self {
        self.line_length_limit = limit;
        self
    }

    #[must_use]
    pub fn with_line_count_limit(mut self, limit: usize) -> Self {
        self.line_count_limit = limit;
        self
    }

    #[must_use]
    pub fn with_source_types<I, S>(mut self, source_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_types = Some(source_types.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_failure_warn_threshold(mut self, threshold: u32) -> Self {
        self.failure_warn_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_start_mtime(mut self, start_mtime: SystemTime) -> Self {
        self.start_mtime = Some(start_mtime);
        self
    }

    /// Creates a new `MonitorConfig` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `EVENT_MONITOR_DIR` is not set
    /// - a numeric variable is set but is not a positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        let event_dir = env::var("EVENT_MONITOR_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("EVENT_MONITOR_DIR".to_string()))?;

        Self::from_env_with_dir(event_dir)
    }

    /// Like [`MonitorConfig::from_env`], but with the directory supplied by
    /// the caller (e.g. from a command line flag) instead of `EVENT_MONITOR_DIR`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a numeric variable is set but is not a
    /// positive integer.
    pub fn from_env_with_dir(event_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::new(event_dir);

        if let Some(ms) = positive_env::<u64>("EVENT_MONITOR_SCAN_INTERVAL_MS")? {
            config.scan_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = positive_env::<usize>("EVENT_MONITOR_LINE_LENGTH_LIMIT")? {
            config.line_length_limit = limit;
        }
        if let Some(limit) = positive_env::<usize>("EVENT_MONITOR_LINE_COUNT_LIMIT")? {
            config.line_count_limit = limit;
        }
        if let Some(threshold) = positive_env::<u32>("EVENT_MONITOR_FAILURE_WARN_THRESHOLD")? {
            config.failure_warn_threshold = threshold;
        }

        // Optional: EVENT_MONITOR_SOURCE_TYPES (default: None = all sources)
        // An empty list means no filter, not "follow nothing"
        config.source_types = env::var("EVENT_MONITOR_SOURCE_TYPES")
            .ok()
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|types| !types.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first zero limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |key: &str, what: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{what} must be greater than 0"),
        };

        if self.scan_interval.is_zero() {
            return Err(zero("scan_interval", "scan interval"));
        }
        if self.line_length_limit == 0 {
            return Err(zero("line_length_limit", "line length limit"));
        }
        if self.line_count_limit == 0 {
            return Err(zero("line_count_limit", "line count limit"));
        }
        if self.failure_warn_threshold == 0 {
            return Err(zero("failure_warn_threshold", "failure threshold"));
        }
        Ok(())
    }
}

/// Reads an optional positive integer from the environment.
fn positive_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };

    let parsed = val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected positive integer, got '{val}'"),
    })?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value must be greater than 0".to_string(),
        });
    }
    Ok(Some(parsed))
}

//! Error types for the event monitor.
//!
//! Each concern has its own error enum next to its code (`ConfigError`,
//! `TrackerError`, `ParseError`, `WriterError`). Per-line and per-file
//! failures never leave the monitor loop; they are logged and counted.
//! [`MonitorError`] covers what surfaces from starting a monitor and from
//! waiting on its handle.

use thiserror::Error;
use tokio::runtime::TryCurrentError;

use crate::config::ConfigError;

/// Errors returned when starting or waiting on a monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No runtime handle was given and none is current.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(#[from] TryCurrentError),

    /// The monitor was cancelled before it finished.
    #[error("monitor cancelled")]
    Cancelled,

    /// The monitor task panicked, typically inside the batch consumer.
    #[error("monitor task panicked: {0}")]
    Panicked(String),
}

impl MonitorError {
    /// Whether this error is the cancellation signal rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

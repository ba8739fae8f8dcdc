//! Event Monitor - tails rotated structured event logs.
//!
//! Cluster processes append JSON event records, one per line, to
//! `event_<SOURCE_TYPE>.log` files in a shared directory and rotate them by
//! size. This crate discovers those files, follows newly appended complete
//! lines across rotation and truncation, parses them, and delivers one batch
//! per scan cycle to a consumer.
//!
//! # Delivery
//!
//! Delivery is at-least-once: offsets live only in memory, so a restarted
//! monitor re-delivers whatever is still in the live files. Consumers
//! de-duplicate on [`EventRecord::event_id`].
//!
//! # Modules
//!
//! - [`types`]: Event record schema, source types and severities
//! - [`scanner`]: Directory scanner for live event log files
//! - [`tracker`]: Per-file offsets, rotation detection and the bounded line reader
//! - [`parser`]: Line decoders, including the event record parser
//! - [`monitor`]: The cancellable polling loop and its handle
//! - [`writer`]: Size-rotated event log writer
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations

pub mod config;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod scanner;
pub mod tracker;
pub mod types;
pub mod writer;

pub use config::{ConfigError, MonitorConfig};
pub use error::{MonitorError, Result};
pub use monitor::{
    channel, monitor_events, monitor_records, BatchConsumer, ChannelConsumer, Monitor,
    MonitorHandle, MonitorState, MonitorStats,
};
pub use parser::{EventParser, LineDecoder, ParseError, RawLines};
pub use scanner::DirectoryScanner;
pub use tracker::{FileTracker, ReadOutcome, ReaderConfig, TrackerError};
pub use types::{EventRecord, Severity, SourceType};
pub use writer::{EventLogger, RotatingEventWriter, RotationPolicy, WriterError};

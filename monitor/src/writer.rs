//! Size-rotated event log writer.
//!
//! [`RotatingEventWriter`] appends one JSON object per line to
//! `<dir>/event_<SOURCE_TYPE>.log`. Before a write that would take the live
//! file to `max_bytes` or beyond, the live file is renamed to `.1`, older
//! backups shift up by one, and anything past `backup_count` is deleted. This
//! is the file contract the monitor consumes.
//!
//! [`EventLogger`] builds complete [`EventRecord`]s around a writer: it stamps
//! host, pid and time and merges a per-logger global context into each
//! record's custom fields.
//!
//! # Example
//!
//! ```no_run
//! use event_monitor::types::SourceType;
//! use event_monitor::writer::{EventLogger, RotationPolicy};
//!
//! let mut logger = EventLogger::open("/tmp/events", SourceType::Jobs, RotationPolicy::default())?;
//! logger.set_global_context([("job_id", "01000000")]);
//! logger.info("Started a job", [("submission_id", "raysubmit_1")])?;
//! # Ok::<(), event_monitor::writer::WriterError>(())
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{local_hostname, EventRecord, Severity, SourceType};

/// Default size at which the live file is rotated (64 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default number of rotated backups kept.
pub const DEFAULT_BACKUP_COUNT: usize = 20;

/// Errors that can occur while writing events.
#[derive(Error, Debug)]
pub enum WriterError {
    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The record could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// When to rotate and how many backups to keep.
///
/// A zero `max_bytes` or zero `backup_count` disables rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub backup_count: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            backup_count: DEFAULT_BACKUP_COUNT,
        }
    }
}

impl RotationPolicy {
    fn enabled(&self) -> bool {
        self.max_bytes > 0 && self.backup_count > 0
    }
}

/// Appends event lines to one source's live log file, rotating by size.
#[derive(Debug)]
pub struct RotatingEventWriter {
    path: PathBuf,
    policy: RotationPolicy,
    file: File,
    size: u64,
}

impl RotatingEventWriter {
    /// Opens (creating if needed) the live file for `source_type` in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be created.
    pub fn new(
        dir: impl AsRef<Path>,
        source_type: SourceType,
        policy: RotationPolicy,
    ) -> Result<Self, WriterError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(source_type.log_file_name());
        let file = open_append(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            policy,
            file,
            size,
        })
    }

    /// Path of the live file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of backup number `index` (1 is the most recent).
    #[must_use]
    pub fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Serializes `record` and appends it as one line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, rotation or the write fails.
    pub fn write_record(&mut self, record: &EventRecord) -> Result<(), WriterError> {
        let line = serde_json::to_string(record)?;
        self.write_line(&line)
    }

    /// Appends a pre-serialized line; a newline is added.
    ///
    /// # Errors
    ///
    /// Returns an error if rotation or the write fails.
    pub fn write_line(&mut self, line: &str) -> Result<(), WriterError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        if self.should_rotate(buf.len() as u64) {
            self.rotate()?;
        }

        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.size += buf.len() as u64;
        Ok(())
    }

    fn should_rotate(&self, incoming: u64) -> bool {
        self.policy.enabled() && self.size > 0 && self.size + incoming >= self.policy.max_bytes
    }

    fn rotate(&mut self) -> Result<(), WriterError> {
        for index in (1..self.policy.backup_count).rev() {
            let src = self.backup_path(index);
            if src.exists() {
                replace(&src, &self.backup_path(index + 1))?;
            }
        }
        replace(&self.path, &self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.size = 0;

        debug!(path = %self.path.display(), "Rotated event log");
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Renames `src` over `dst`, removing `dst` first for platforms where rename
/// does not replace.
fn replace(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(src, dst)
}

/// Builds event records for one source type and writes them.
#[derive(Debug)]
pub struct EventLogger {
    writer: RotatingEventWriter,
    source_type: SourceType,
    host_name: String,
    pid: u32,
    global_context: BTreeMap<String, String>,
}

impl EventLogger {
    /// Wraps an existing writer.
    #[must_use]
    pub fn new(writer: RotatingEventWriter, source_type: SourceType) -> Self {
        Self {
            writer,
            source_type,
            host_name: local_hostname(),
            pid: std::process::id(),
            global_context: BTreeMap::new(),
        }
    }

    /// Opens a writer for `source_type` in `dir` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the live file cannot be opened.
    pub fn open(
        dir: impl AsRef<Path>,
        source_type: SourceType,
        policy: RotationPolicy,
    ) -> Result<Self, WriterError> {
        let writer = RotatingEventWriter::new(dir, source_type, policy)?;
        Ok(Self::new(writer, source_type))
    }

    /// Replaces the fields merged into every record written from now on.
    pub fn set_global_context<I, K, V>(&mut self, context: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.global_context = context
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
    }

    /// The underlying writer.
    #[must_use]
    pub fn writer(&self) -> &RotatingEventWriter {
        &self.writer
    }

    /// Writes one event. Per-call fields win over the global context.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn emit<I, K, V>(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        fields: I,
    ) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut record = EventRecord::new(self.source_type, severity, message);
        record.host_name.clone_from(&self.host_name);
        record.pid = self.pid;
        record.custom_fields = self.global_context.clone();
        record
            .custom_fields
            .extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));

        if let Err(e) = self.writer.write_record(&record) {
            warn!(path = %self.writer.path().display(), error = %e, "Failed to write event");
            return Err(e);
        }
        Ok(record)
    }

    pub fn debug<I, K, V>(&mut self, message: impl Into<String>, fields: I) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.emit(Severity::Debug, message, fields)
    }

    pub fn info<I, K, V>(&mut self, message: impl Into<String>, fields: I) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.emit(Severity::Info, message, fields)
    }

    pub fn warning<I, K, V>(&mut self, message: impl Into<String>, fields: I) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.emit(Severity::Warning, message, fields)
    }

    pub fn error<I, K, V>(&mut self, message: impl Into<String>, fields: I) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.emit(Severity::Error, message, fields)
    }

    pub fn fatal<I, K, V>(&mut self, message: impl Into<String>, fields: I) -> Result<EventRecord, WriterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.emit(Severity::Fatal, message, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::EventParser;
    use tempfile::TempDir;

    const NO_FIELDS: [(&str, &str); 0] = [];

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_logger_writes_one_record_per_line() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger =
            EventLogger::open(temp_dir.path(), SourceType::Gcs, RotationPolicy::default()).unwrap();
        logger.set_global_context([("test_meta", "1")]);

        logger.info("message", [("a", "a")]).unwrap();
        logger.error("message", [("b", "b")]).unwrap();
        logger.warning("message", NO_FIELDS).unwrap();
        logger.fatal("message", NO_FIELDS).unwrap();

        let path = temp_dir.path().join("event_GCS.log");
        assert_eq!(logger.writer().path(), path);

        let parser = EventParser::new();
        let records: Vec<EventRecord> = read_lines(&path)
            .iter()
            .map(|line| parser.parse_line(line).unwrap())
            .collect();

        let severities: Vec<Severity> = records.iter().map(|r| r.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Info, Severity::Error, Severity::Warning, Severity::Fatal]
        );
        for record in &records {
            assert_eq!(record.source_type, "GCS");
            assert_eq!(record.message, "message");
            assert_eq!(record.event_id.len(), 36);
            assert_eq!(record.pid, std::process::id());
            assert!(record.label.is_empty());
            assert_eq!(record.custom_field("test_meta"), Some("1"));
        }
        assert_eq!(records[0].custom_field("a"), Some("a"));
        assert_eq!(records[1].custom_field("b"), Some("b"));
    }

    #[test]
    fn test_call_fields_override_global_context() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger =
            EventLogger::open(temp_dir.path(), SourceType::Jobs, RotationPolicy::default()).unwrap();
        logger.set_global_context([("job_id", "global")]);

        let record = logger.debug("m", [("job_id", "local")]).unwrap();
        assert_eq!(record.custom_field("job_id"), Some("local"));
    }

    #[test]
    fn test_rotation_keeps_bounded_backups() {
        let temp_dir = TempDir::new().unwrap();
        let policy = RotationPolicy {
            max_bytes: 10,
            backup_count: 3,
        };
        let mut writer = RotatingEventWriter::new(temp_dir.path(), SourceType::Common, policy).unwrap();

        // 4 bytes per line: each file holds two lines before rotating
        for i in 0..10 {
            writer.write_line(&format!("{i:03}")).unwrap();
        }

        assert_eq!(read_lines(writer.path()), vec!["008", "009"]);
        assert_eq!(read_lines(&writer.backup_path(1)), vec!["006", "007"]);
        assert_eq!(read_lines(&writer.backup_path(2)), vec!["004", "005"]);
        assert_eq!(read_lines(&writer.backup_path(3)), vec!["002", "003"]);
        assert!(!writer.backup_path(4).exists());
    }

    #[test]
    fn test_rotation_disabled_with_zero_backups() {
        let temp_dir = TempDir::new().unwrap();
        let policy = RotationPolicy {
            max_bytes: 4,
            backup_count: 0,
        };
        let mut writer = RotatingEventWriter::new(temp_dir.path(), SourceType::Common, policy).unwrap();

        for i in 0..5 {
            writer.write_line(&i.to_string()).unwrap();
        }

        assert_eq!(read_lines(writer.path()).len(), 5);
        assert!(!writer.backup_path(1).exists());
    }

    #[test]
    fn test_oversized_single_line_written_without_rotating_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let policy = RotationPolicy {
            max_bytes: 4,
            backup_count: 2,
        };
        let mut writer = RotatingEventWriter::new(temp_dir.path(), SourceType::Common, policy).unwrap();

        writer.write_line("longer than four").unwrap();
        assert!(!writer.backup_path(1).exists());

        writer.write_line("x").unwrap();
        assert_eq!(read_lines(&writer.backup_path(1)), vec!["longer than four"]);
        assert_eq!(read_lines(writer.path()), vec!["x"]);
    }

    #[test]
    fn test_reopen_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            RotatingEventWriter::new(temp_dir.path(), SourceType::Raylet, RotationPolicy::default())
                .unwrap();
        writer.write_line("one").unwrap();
        drop(writer);

        let mut writer =
            RotatingEventWriter::new(temp_dir.path(), SourceType::Raylet, RotationPolicy::default())
                .unwrap();
        writer.write_line("two").unwrap();

        assert_eq!(read_lines(writer.path()), vec!["one", "two"]);
    }
}

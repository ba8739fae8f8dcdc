//! Per-file read offsets and the bounded line reader.
//!
//! The [`FileTracker`] remembers, for each live event log, the byte offset up
//! to which complete lines have been consumed together with enough identity
//! information to notice when the path now names a different file.
//!
//! # Rotation
//!
//! Before each read the file is stat'ed. The offset is reset to 0 when the
//! file is smaller than the stored offset (truncation, or rotation where the
//! new file is still short) or when its device/inode pair changed (rotation by
//! rename, detected even if the new file is already larger). The inode check
//! is only available on Unix.
//!
//! # Limits
//!
//! A single read consumes at most `line_count_limit` lines. A line longer
//! than `line_length_limit` bytes (newline excluded) is consumed but never
//! returned, and only `line_length_limit + 1` of its bytes are ever buffered.
//! A trailing fragment without a newline is left unread for the next scan.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Maximum number of bytes of an oversized line echoed to the log.
const OVERSIZED_PREVIEW_BYTES: usize = 100;

/// Errors that can occur while reading a tracked file.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// The file could not be opened, stat'ed or read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The path is not in the tracker.
    #[error("file is not tracked: {0}")]
    NotTracked(PathBuf),
}

impl TrackerError {
    /// Whether the error means the file disappeared since it was discovered.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Identifies the underlying file a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    /// Extracts the identity from file metadata, when the platform has one.
    #[cfg(unix)]
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;

        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Extracts the identity from file metadata, when the platform has one.
    #[cfg(not(unix))]
    #[must_use]
    pub fn from_metadata(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

/// Limits applied to every read.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Longest accepted line in bytes, newline excluded.
    pub line_length_limit: usize,

    /// Maximum number of lines consumed per file per read.
    pub line_count_limit: usize,

    /// Files not modified after this instant are left alone.
    pub start_mtime: Option<SystemTime>,
}

/// Tracker state for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    /// Byte offset just past the last consumed line.
    pub offset: u64,

    /// Identity of the file the offset belongs to.
    pub identity: Option<FileIdentity>,

    /// Size observed at the last read.
    pub size: u64,

    /// Modification time observed at the last read.
    pub mtime: Option<SystemTime>,
}

impl TrackedFile {
    fn new() -> Self {
        Self {
            offset: 0,
            identity: None,
            size: 0,
            mtime: None,
        }
    }
}

/// Result of reading one tracked file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Complete lines in file order, newline and trailing `\r` stripped.
    /// Empty lines are kept so the decoder sees and accounts for them.
    pub lines: Vec<String>,

    /// Lines dropped for exceeding the length limit.
    pub oversized: usize,

    /// Whether the offset was reset because the file was rotated or truncated.
    pub rotated: bool,
}

/// Changes applied by [`FileTracker::reconcile`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Newly discovered paths.
    pub added: Vec<PathBuf>,
    /// Paths that were tracked but are gone.
    pub removed: Vec<PathBuf>,
}

/// In-memory offsets for every live event log.
#[derive(Debug, Default)]
pub struct FileTracker {
    files: BTreeMap<PathBuf, TrackedFile>,
}

impl FileTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Tracked paths in stable (path) order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// State of one tracked file.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&TrackedFile> {
        self.files.get(path)
    }

    /// Current offset of one tracked file.
    #[must_use]
    pub fn offset(&self, path: &Path) -> Option<u64> {
        self.files.get(path).map(|file| file.offset)
    }

    /// Aligns the tracked set with a fresh directory listing: new paths start
    /// at offset 0, missing paths are forgotten.
    pub fn reconcile(&mut self, discovered: &BTreeSet<PathBuf>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        self.files.retain(|path, _| {
            let keep = discovered.contains(path);
            if !keep {
                info!(path = %path.display(), "Event file no longer present, dropping offset");
                summary.removed.push(path.clone());
            }
            keep
        });

        for path in discovered {
            if !self.files.contains_key(path) {
                info!(path = %path.display(), "Found new event file");
                self.files.insert(path.clone(), TrackedFile::new());
                summary.added.push(path.clone());
            }
        }

        summary
    }

    /// Reads the complete lines appended to `path` since the last read.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::NotTracked`] for an unknown path and
    /// [`TrackerError::Io`] if the file cannot be opened or read. On error the
    /// stored offset is left untouched.
    pub fn read_new_lines(
        &mut self,
        path: &Path,
        config: &ReaderConfig,
    ) -> Result<ReadOutcome, TrackerError> {
        let entry = self
            .files
            .get_mut(path)
            .ok_or_else(|| TrackerError::NotTracked(path.to_path_buf()))?;

        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let size = metadata.len();
        let mtime = metadata.modified().ok();
        let identity = FileIdentity::from_metadata(&metadata);

        if let (Some(start), Some(modified)) = (config.start_mtime, mtime) {
            if modified <= start {
                trace!(path = %path.display(), "File not modified since start time, skipping");
                return Ok(ReadOutcome::default());
            }
        }

        let mut outcome = ReadOutcome::default();
        let replaced = entry.identity.is_some() && identity.is_some() && entry.identity != identity;

        let read_position = if replaced {
            info!(
                path = %path.display(),
                old_pos = entry.offset,
                new_size = size,
                "File replaced, resetting position to 0"
            );
            outcome.rotated = true;
            0
        } else if size < entry.offset {
            info!(
                path = %path.display(),
                old_pos = entry.offset,
                new_size = size,
                "File truncated, resetting position to 0"
            );
            outcome.rotated = true;
            0
        } else {
            entry.offset
        };

        if !outcome.rotated
            && read_position == size
            && entry.size == size
            && entry.mtime == mtime
        {
            trace!(path = %path.display(), "File unchanged since last read");
            entry.identity = identity;
            return Ok(outcome);
        }

        let consumed = if read_position < size {
            let mut reader = BufReader::new(file);
            reader.seek(SeekFrom::Start(read_position))?;
            read_complete_lines(&mut reader, path, config, &mut outcome)?
        } else {
            0
        };

        entry.offset = read_position + consumed;
        entry.size = size;
        entry.mtime = mtime;
        entry.identity = identity;

        if !outcome.lines.is_empty() || outcome.oversized > 0 {
            debug!(
                path = %path.display(),
                line_count = outcome.lines.len(),
                oversized = outcome.oversized,
                offset = entry.offset,
                "Read new lines from file"
            );
        }

        Ok(outcome)
    }
}

/// Consumes up to `line_count_limit` newline-terminated lines from `reader`
/// and returns the number of bytes they occupied.
///
/// The bytes of a trailing fragment are read but not counted, so the caller's
/// offset stays at the start of that fragment.
fn read_complete_lines<R: BufRead>(
    reader: &mut R,
    path: &Path,
    config: &ReaderConfig,
    outcome: &mut ReadOutcome,
) -> io::Result<u64> {
    let limit = config.line_length_limit;
    let mut consumed: u64 = 0;
    let mut line_count = 0;
    let mut line: Vec<u8> = Vec::new();
    let mut line_len: usize = 0;

    while line_count < config.line_count_limit {
        let (complete, used) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    append_bounded(&mut line, &buf[..idx], limit);
                    (true, idx + 1)
                }
                None => {
                    append_bounded(&mut line, buf, limit);
                    (false, buf.len())
                }
            }
        };
        reader.consume(used);

        if !complete {
            line_len += used;
            continue;
        }

        line_len += used - 1;
        consumed += line_len as u64 + 1;
        line_count += 1;

        if line_len > limit {
            let preview_len = line.len().min(OVERSIZED_PREVIEW_BYTES).min(limit);
            warn!(
                path = %path.display(),
                preview = %String::from_utf8_lossy(&line[..preview_len]),
                length = line_len,
                limit,
                "Ignored oversized event line"
            );
            outcome.oversized += 1;
        } else {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            outcome
                .lines
                .push(String::from_utf8_lossy(&line).into_owned());
        }

        line.clear();
        line_len = 0;
    }

    Ok(consumed)
}

/// Appends `bytes` to `line` without letting it grow past `limit + 1` bytes.
fn append_bounded(line: &mut Vec<u8>, bytes: &[u8], limit: usize) {
    let room = (limit + 1).saturating_sub(line.len());
    line.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

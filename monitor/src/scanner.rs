//! Directory scanner for live event log files.
//!
//! A live event log is named `event_<SOURCE_TYPE>.log`, where the source type
//! is made of ASCII letters, digits and underscores. Rotation backups such as
//! `event_GCS.log.1` and any other file in the directory are ignored, and
//! subdirectories are not descended.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

const EVENT_FILE_PREFIX: &str = "event_";
const EVENT_FILE_SUFFIX: &str = ".log";

/// Returns the source type encoded in a live event log file name.
///
/// ```
/// use std::path::Path;
/// use event_monitor::scanner::event_source_type;
///
/// assert_eq!(event_source_type(Path::new("/logs/event_GCS.log")), Some("GCS"));
/// assert_eq!(event_source_type(Path::new("/logs/event_GCS.log.1")), None);
/// ```
#[must_use]
pub fn event_source_type(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    let source = name
        .strip_prefix(EVENT_FILE_PREFIX)?
        .strip_suffix(EVENT_FILE_SUFFIX)?;

    let valid = !source.is_empty()
        && source
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    valid.then_some(source)
}

/// Lists the live event log files of one directory.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    dir: PathBuf,
    source_types: Option<HashSet<String>>,
}

impl DirectoryScanner {
    /// Creates a scanner that accepts every source type.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            source_types: None,
        }
    }

    /// Restricts the scan to the given source types. Names are compared
    /// ASCII case-insensitively against the file name.
    #[must_use]
    pub fn with_source_types<I, S>(mut self, source_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_types = Some(
            source_types
                .into_iter()
                .map(|s| s.into().to_ascii_uppercase())
                .collect(),
        );
        self
    }

    /// Returns the directory being scanned.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists matching files in path order.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be listed. Entries that
    /// vanish or cannot be inspected mid-listing are skipped.
    pub fn scan(&self) -> io::Result<BTreeSet<PathBuf>> {
        let mut found = BTreeSet::new();

        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();

            let Some(source) = event_source_type(&path) else {
                trace!(path = %path.display(), "Ignoring non-event file");
                continue;
            };

            if let Some(allowed) = &self.source_types {
                if !allowed.contains(&source.to_ascii_uppercase()) {
                    trace!(path = %path.display(), source, "Source type filtered out");
                    continue;
                }
            }

            if !path.is_file() {
                continue;
            }

            found.insert(path);
        }

        debug!(
            dir = %self.dir.display(),
            file_count = found.len(),
            "Scanned event directory"
        );

        Ok(found)
    }
}

//! The polling monitor loop.
//!
//! A [`Monitor`] owns a [`DirectoryScanner`], a [`FileTracker`] and a
//! [`LineDecoder`]. Once spawned it runs one scan cycle immediately and then
//! one cycle per `scan_interval`:
//!
//! 1. list the live event files and reconcile the tracker;
//! 2. for each tracked file, in path order, read the new complete lines;
//! 3. decode every line, dropping (and logging) the ones that fail;
//! 4. hand everything decoded in this cycle to the consumer in one call.
//!
//! The consumer runs inside the monitor task, so a slow consumer delays the
//! next cycle. Use [`channel`] for a consumer that only enqueues.
//!
//! # Cancellation
//!
//! [`MonitorHandle::cancel`] (or dropping the handle) stops the loop at the
//! inter-cycle sleep, or between two files of an in-progress cycle. A cycle
//! interrupted this way delivers nothing. Waiting on a cancelled handle
//! returns [`MonitorError::Cancelled`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use event_monitor::monitor::monitor_events;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut handle = monitor_events(
//!         "/tmp/session/logs/events",
//!         |lines: Vec<String>| println!("{} new lines", lines.len()),
//!         None,
//!         Duration::from_millis(500),
//!     )
//!     .expect("valid scan interval");
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     handle.cancel();
//!     assert!(handle.wait().await.unwrap_err().is_cancelled());
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigError, MonitorConfig};
use crate::error::{MonitorError, Result};
use crate::parser::{EventParser, LineDecoder, RawLines};
use crate::scanner::DirectoryScanner;
use crate::tracker::{FileTracker, ReaderConfig};
use crate::types::EventRecord;

/// Receives the batch produced by each scan cycle.
pub trait BatchConsumer<T>: Send + 'static {
    /// Called once per cycle that produced at least one value.
    fn consume(&mut self, batch: Vec<T>);
}

impl<T, F> BatchConsumer<T> for F
where
    F: FnMut(Vec<T>) + Send + 'static,
{
    fn consume(&mut self, batch: Vec<T>) {
        self(batch);
    }
}

/// Consumer that forwards each batch over an unbounded channel.
#[derive(Debug)]
pub struct ChannelConsumer<T> {
    tx: mpsc::UnboundedSender<Vec<T>>,
}

impl<T: Send + 'static> BatchConsumer<T> for ChannelConsumer<T> {
    fn consume(&mut self, batch: Vec<T>) {
        if self.tx.send(batch).is_err() {
            warn!("Batch receiver dropped, discarding batch");
        }
    }
}

/// Creates a channel-backed consumer and the receiver for its batches.
#[must_use]
pub fn channel<T>() -> (ChannelConsumer<T>, mpsc::UnboundedReceiver<Vec<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelConsumer { tx }, rx)
}

/// Lifecycle of a monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed, first cycle not started yet.
    Created,
    /// Scanning periodically.
    Running,
    /// Stopped by cancellation. Terminal.
    Cancelled,
    /// Stopped because the task failed. Terminal.
    Finished,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Cancelled,
            _ => Self::Finished,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Cancelled => 2,
            Self::Finished => 3,
        }
    }
}

/// Cumulative diagnostics for one monitor instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Scan cycles started.
    pub cycles: u64,
    /// Complete, non-oversized lines read.
    pub lines_read: u64,
    /// Values handed to the consumer.
    pub records_delivered: u64,
    /// Lines dropped for exceeding the length limit.
    pub oversized_lines: u64,
    /// Lines the decoder rejected.
    pub malformed_lines: u64,
    /// File reads that failed with an I/O error.
    pub read_errors: u64,
    /// Directory listings that failed in a row; reset by a successful listing.
    pub consecutive_scan_failures: u32,
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    cycles: AtomicU64,
    lines_read: AtomicU64,
    records_delivered: AtomicU64,
    oversized_lines: AtomicU64,
    malformed_lines: AtomicU64,
    read_errors: AtomicU64,
    consecutive_scan_failures: AtomicU32,
}

impl Shared {
    fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MonitorState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            lines_read: self.lines_read.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            oversized_lines: self.oversized_lines.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            consecutive_scan_failures: self.consecutive_scan_failures.load(Ordering::Relaxed),
        }
    }
}

/// Tails the event files of one directory.
#[derive(Debug)]
pub struct Monitor<D> {
    scanner: DirectoryScanner,
    tracker: FileTracker,
    reader: ReaderConfig,
    decoder: D,
    scan_interval: Duration,
    failure_warn_threshold: u32,
    shared: Arc<Shared>,
}

impl<D: LineDecoder> Monitor<D> {
    /// Creates a monitor in the [`MonitorState::Created`] state.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a limit in `config` is zero.
    pub fn new(config: MonitorConfig, decoder: D) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let mut scanner = DirectoryScanner::new(config.event_dir);
        if let Some(source_types) = config.source_types {
            scanner = scanner.with_source_types(source_types);
        }

        Ok(Self {
            scanner,
            tracker: FileTracker::new(),
            reader: ReaderConfig {
                line_length_limit: config.line_length_limit,
                line_count_limit: config.line_count_limit,
                start_mtime: config.start_mtime,
            },
            decoder,
            scan_interval: config.scan_interval,
            failure_warn_threshold: config.failure_warn_threshold,
            shared: Arc::new(Shared::default()),
        })
    }

    /// The tracker holding per-file offsets.
    #[must_use]
    pub fn tracker(&self) -> &FileTracker {
        &self.tracker
    }

    /// Counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        self.shared.snapshot()
    }

    /// Runs a single scan cycle synchronously and returns its batch.
    pub fn scan_once(&mut self) -> Vec<D::Output> {
        self.collect_batch(&CancellationToken::new())
            .unwrap_or_default()
    }

    /// Starts the loop on `runtime`, or on the current runtime when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NoRuntime`] if `runtime` is `None` and this is
    /// called outside a Tokio runtime.
    pub fn spawn<C>(self, consumer: C, runtime: Option<Handle>) -> Result<MonitorHandle>
    where
        C: BatchConsumer<D::Output>,
    {
        let runtime = match runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(self.run(consumer, cancel.clone()));

        Ok(MonitorHandle {
            task: Some(task),
            cancel,
            shared,
        })
    }

    async fn run<C>(mut self, mut consumer: C, cancel: CancellationToken) -> Result<()>
    where
        C: BatchConsumer<D::Output>,
    {
        self.shared.set_state(MonitorState::Running);
        info!(
            dir = %self.scanner.dir().display(),
            scan_interval_ms = self.scan_interval.as_millis() as u64,
            line_length_limit = self.reader.line_length_limit,
            line_count_limit = self.reader.line_count_limit,
            "Event monitor started"
        );

        loop {
            if let Some(batch) = self.collect_batch(&cancel) {
                if !batch.is_empty() && !cancel.is_cancelled() {
                    Shared::add(&self.shared.records_delivered, batch.len());
                    debug!(record_count = batch.len(), "Delivering event batch");
                    consumer.consume(batch);
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.scan_interval) => {}
            }
        }

        self.shared.set_state(MonitorState::Cancelled);
        info!(
            dir = %self.scanner.dir().display(),
            tracked_files = self.tracker.len(),
            "Event monitor cancelled"
        );
        Err(MonitorError::Cancelled)
    }

    /// One scan cycle. Returns `None` if cancelled part way through.
    fn collect_batch(&mut self, cancel: &CancellationToken) -> Option<Vec<D::Output>> {
        self.shared.cycles.fetch_add(1, Ordering::Relaxed);

        let discovered = match self.scanner.scan() {
            Ok(discovered) => discovered,
            Err(e) => {
                self.record_scan_failure(&e);
                return Some(Vec::new());
            }
        };
        self.shared
            .consecutive_scan_failures
            .store(0, Ordering::Relaxed);
        self.tracker.reconcile(&discovered);

        let paths: Vec<PathBuf> = self.tracker.paths().map(Path::to_path_buf).collect();
        let mut batch = Vec::new();

        for path in &paths {
            if cancel.is_cancelled() {
                debug!("Cancelled mid-scan, discarding partial batch");
                return None;
            }

            let outcome = match self.tracker.read_new_lines(path, &self.reader) {
                Ok(outcome) => outcome,
                Err(e) if e.is_not_found() => {
                    debug!(path = %path.display(), "Event file vanished before read");
                    continue;
                }
                Err(e) => {
                    Shared::add(&self.shared.read_errors, 1);
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read event file, will retry next scan"
                    );
                    continue;
                }
            };

            Shared::add(&self.shared.lines_read, outcome.lines.len());
            Shared::add(&self.shared.oversized_lines, outcome.oversized);

            for line in outcome.lines {
                match self.decoder.decode(&line) {
                    Ok(value) => batch.push(value),
                    Err(e) => {
                        Shared::add(&self.shared.malformed_lines, 1);
                        warn!(
                            path = %path.display(),
                            kind = e.kind(),
                            error = %e,
                            "Dropping malformed event line"
                        );
                    }
                }
            }
        }

        if batch.is_empty() {
            trace!("No new events this cycle");
        }
        Some(batch)
    }

    fn record_scan_failure(&self, err: &std::io::Error) {
        let failures = self
            .shared
            .consecutive_scan_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let dir = self.scanner.dir().display();

        if failures < self.failure_warn_threshold {
            warn!(dir = %dir, error = %err, failures, "Failed to list event directory, will retry next scan");
        } else if failures == self.failure_warn_threshold {
            error!(dir = %dir, error = %err, failures, "Event directory unreadable for consecutive scans");
        } else {
            debug!(dir = %dir, error = %err, failures, "Event directory still unreadable");
        }
    }
}

/// Handle to a spawned monitor.
///
/// Dropping the handle cancels the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    task: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl MonitorHandle {
    /// Requests cancellation. The loop stops at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this monitor when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the monitor task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        self.shared.state()
    }

    /// Counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        self.shared.snapshot()
    }

    /// Waits for the monitor task to exit.
    ///
    /// The loop only exits through cancellation, so this resolves to
    /// `Err(MonitorError::Cancelled)` after [`MonitorHandle::cancel`]. A
    /// panic inside the task (e.g. in the consumer) is reported as
    /// [`MonitorError::Panicked`].
    ///
    /// # Errors
    ///
    /// See above.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return match self.shared.state() {
                MonitorState::Cancelled => Err(MonitorError::Cancelled),
                _ => Ok(()),
            };
        };

        let joined = task.await;
        self.task = None;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                self.shared.set_state(MonitorState::Cancelled);
                Err(MonitorError::Cancelled)
            }
            Err(e) => {
                self.shared.set_state(MonitorState::Finished);
                Err(MonitorError::Panicked(e.to_string()))
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Monitors `event_dir` and delivers each cycle's new raw lines to `consumer`.
///
/// `runtime` selects where the loop runs; `None` uses the current runtime.
///
/// # Errors
///
/// Returns [`MonitorError::Config`] if `scan_interval` is zero, and
/// [`MonitorError::NoRuntime`] if `runtime` is `None` outside a Tokio runtime.
pub fn monitor_events<C>(
    event_dir: impl Into<PathBuf>,
    consumer: C,
    runtime: Option<Handle>,
    scan_interval: Duration,
) -> Result<MonitorHandle>
where
    C: BatchConsumer<String>,
{
    let config = MonitorConfig::new(event_dir).with_scan_interval(scan_interval);
    Monitor::new(config, RawLines)?.spawn(consumer, runtime)
}

/// Monitors `event_dir` and delivers each cycle's parsed [`EventRecord`]s.
///
/// # Errors
///
/// Same conditions as [`monitor_events`].
pub fn monitor_records<C>(
    event_dir: impl Into<PathBuf>,
    consumer: C,
    runtime: Option<Handle>,
    scan_interval: Duration,
) -> Result<MonitorHandle>
where
    C: BatchConsumer<EventRecord>,
{
    let config = MonitorConfig::new(event_dir).with_scan_interval(scan_interval);
    Monitor::new(config, EventParser)?.spawn(consumer, runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn event_line(id: &str, message: &str) -> String {
        format!(
            r#"{{"event_id":"{id}","source_type":"GCS","message":"{message}","time_stamp":1.0,"severity":"INFO"}}"#
        )
    }

    fn config(dir: &Path) -> MonitorConfig {
        MonitorConfig::new(dir).with_scan_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (consumer, _rx) = channel::<String>();
        let err = monitor_events("/x", consumer, None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn test_entry_point_outside_runtime_is_error() {
        let (consumer, _rx) = channel::<String>();
        let err = monitor_events("/tmp", consumer, None, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, MonitorError::NoRuntime(_)));
    }

    #[test]
    fn test_cancelled_cycle_delivers_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("event_GCS.log");
        fs::write(&path, "a\nb\n").unwrap();
        let mut monitor = Monitor::new(config(temp_dir.path()), RawLines).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(monitor.collect_batch(&cancel).is_none());
        assert_eq!(monitor.tracker().offset(&path), Some(0));
        assert_eq!(monitor.stats().lines_read, 0);
    }

    #[test]
    fn test_new_rejects_zero_limits() {
        let err = Monitor::new(MonitorConfig::new("/x").with_line_length_limit(0), RawLines)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_scan_once_concatenates_files_in_path_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("event_RAYLET.log"), "r1\nr2\n").unwrap();
        fs::write(temp_dir.path().join("event_GCS.log"), "g1\n").unwrap();
        fs::write(temp_dir.path().join("event_GCS.log.1"), "backup\n").unwrap();

        let mut monitor = Monitor::new(config(temp_dir.path()), RawLines).unwrap();

        assert_eq!(monitor.scan_once(), vec!["g1", "r1", "r2"]);
        assert!(monitor.scan_once().is_empty());
        assert_eq!(monitor.tracker().len(), 2);
    }

    #[test]
    fn test_malformed_line_does_not_block_batch() {
        let temp_dir = TempDir::new().unwrap();
        let content = format!(
            "{}\n{{broken\n{}\n",
            event_line("a", "first"),
            event_line("b", "second")
        );
        fs::write(temp_dir.path().join("event_GCS.log"), content).unwrap();

        let mut monitor = Monitor::new(config(temp_dir.path()), EventParser).unwrap();
        let batch = monitor.scan_once();

        let messages: Vec<&str> = batch.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        let stats = monitor.stats();
        assert_eq!(stats.malformed_lines, 1);
        assert_eq!(stats.lines_read, 3);
    }

    #[test]
    fn test_blank_lines_counted_as_malformed() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("event_GCS.log"), "\n\r\n{broken\n").unwrap();

        let mut monitor = Monitor::new(config(temp_dir.path()), EventParser).unwrap();

        assert!(monitor.scan_once().is_empty());
        let stats = monitor.stats();
        assert_eq!(stats.lines_read, 3);
        assert_eq!(stats.malformed_lines, 3);
    }

    #[test]
    fn test_missing_directory_counts_failures() {
        let mut monitor = Monitor::new(config(Path::new("/nonexistent/events")), RawLines).unwrap();

        assert!(monitor.scan_once().is_empty());
        assert!(monitor.scan_once().is_empty());
        assert_eq!(monitor.stats().consecutive_scan_failures, 2);
        assert_eq!(monitor.stats().cycles, 2);
    }

    #[test]
    fn test_failure_count_resets_when_directory_appears() {
        let temp_dir = TempDir::new().unwrap();
        let event_dir = temp_dir.path().join("events");
        let mut monitor = Monitor::new(config(&event_dir), RawLines).unwrap();

        monitor.scan_once();
        assert_eq!(monitor.stats().consecutive_scan_failures, 1);

        fs::create_dir(&event_dir).unwrap();
        fs::write(event_dir.join("event_JOBS.log"), "x\n").unwrap();
        assert_eq!(monitor.scan_once(), vec!["x"]);
        assert_eq!(monitor.stats().consecutive_scan_failures, 0);
    }

    #[tokio::test]
    async fn test_handle_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("event_GCS.log"), "a\n").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let monitor = Monitor::new(config(temp_dir.path()), RawLines).unwrap();
        assert_eq!(monitor.shared.state(), MonitorState::Created);

        let mut handle = monitor
            .spawn(
                move |batch: Vec<String>| sink.lock().unwrap().extend(batch),
                None,
            )
            .unwrap();
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first batch should arrive");
        assert_eq!(handle.state(), MonitorState::Running);

        handle.cancel();
        let err = handle.wait().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(handle.is_finished());
        assert_eq!(handle.state(), MonitorState::Cancelled);
        assert!(handle.wait().await.unwrap_err().is_cancelled());
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_channel_consumer_receives_batches() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("event_GCS.log"), "one\ntwo\n").unwrap();
        let (consumer, mut rx) = channel();

        let handle = Monitor::new(config(temp_dir.path()), RawLines)
            .unwrap()
            .spawn(consumer, None)
            .unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("batch should arrive")
            .expect("channel open");
        assert_eq!(batch, vec!["one", "two"]);
        assert_eq!(handle.stats().records_delivered, 2);
    }

    #[tokio::test]
    async fn test_runs_on_explicit_runtime_handle() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("event_GCS.log"), "x\n").unwrap();
        let (consumer, mut rx) = channel();

        let _handle = monitor_events(
            temp_dir.path(),
            consumer,
            Some(Handle::current()),
            Duration::from_millis(10),
        )
        .unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec!["x"]);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_monitor() {
        let temp_dir = TempDir::new().unwrap();
        let (consumer, mut rx) = channel::<String>();

        let handle =
            monitor_events(temp_dir.path(), consumer, None, Duration::from_millis(10)).unwrap();
        let token = handle.cancellation_token();
        drop(handle);

        assert!(token.is_cancelled());
        // The consumer (and its sender) is dropped once the task exits
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}

//! Event record schema shared by the writer, the parser and consumers.
//!
//! Each line of an `event_<SOURCE_TYPE>.log` file is one [`EventRecord`]
//! serialized as a JSON object. Field names are snake_case on the wire.
//!
//! Inside the tailing pipeline `source_type` is kept as an opaque string so
//! that files written by newer emitters are never rejected. [`SourceType`]
//! is the closed view of the same value for writers and consumers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Number of random bytes in an event ID (hex encoded to twice as many chars).
const EVENT_ID_BYTES: usize = 18;

/// Subsystems that emit events, one log file family per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceType {
    Common,
    CoreWorker,
    Gcs,
    Raylet,
    ClusterLifecycle,
    Autoscaler,
    Jobs,
    Serve,
}

impl SourceType {
    /// All known source types, in declaration order.
    pub const ALL: [SourceType; 8] = [
        SourceType::Common,
        SourceType::CoreWorker,
        SourceType::Gcs,
        SourceType::Raylet,
        SourceType::ClusterLifecycle,
        SourceType::Autoscaler,
        SourceType::Jobs,
        SourceType::Serve,
    ];

    /// Returns the wire name (e.g. `"GCS"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Common => "COMMON",
            Self::CoreWorker => "CORE_WORKER",
            Self::Gcs => "GCS",
            Self::Raylet => "RAYLET",
            Self::ClusterLifecycle => "CLUSTER_LIFECYCLE",
            Self::Autoscaler => "AUTOSCALER",
            Self::Jobs => "JOBS",
            Self::Serve => "SERVE",
        }
    }

    /// Returns the live log file name for this source, `event_<NAME>.log`.
    #[must_use]
    pub fn log_file_name(self) -> String {
        format!("event_{}.log", self.as_str())
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known [`SourceType`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown source type: {0}")]
pub struct UnknownSourceType(pub String);

impl FromStr for SourceType {
    type Err = UnknownSourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSourceType(s.to_string()))
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// A single structured event, as written to and read from an event log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Random token used by consumers for de-duplication.
    pub event_id: String,

    /// Emitting subsystem, kept opaque (see [`EventRecord::source`]).
    pub source_type: String,

    /// Host that emitted the event.
    #[serde(default, alias = "source_hostname")]
    pub host_name: String,

    /// Process that emitted the event.
    #[serde(default, alias = "source_pid")]
    pub pid: u32,

    /// Short classifier, may be empty.
    #[serde(default)]
    pub label: String,

    /// Free-text payload.
    pub message: String,

    /// Seconds since the Unix epoch.
    #[serde(alias = "timestamp")]
    pub time_stamp: f64,

    pub severity: Severity,

    /// Open string-to-string mapping (job id, node id, ...).
    #[serde(default, deserialize_with = "deserialize_custom_fields")]
    pub custom_fields: BTreeMap<String, String>,
}

impl EventRecord {
    /// Creates a record stamped with a fresh event ID, the local host name,
    /// the current pid and the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use event_monitor::types::{EventRecord, Severity, SourceType};
    ///
    /// let record = EventRecord::new(SourceType::Gcs, Severity::Info, "node added");
    /// assert_eq!(record.source_type, "GCS");
    /// assert_eq!(record.event_id.len(), 36);
    /// ```
    #[must_use]
    pub fn new(source_type: SourceType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            event_id: generate_event_id(),
            source_type: source_type.as_str().to_string(),
            host_name: local_hostname(),
            pid: std::process::id(),
            label: String::new(),
            message: message.into(),
            time_stamp: now_seconds(),
            severity,
            custom_fields: BTreeMap::new(),
        }
    }

    /// Returns the typed source, or `None` for a source this build does not know.
    #[must_use]
    pub fn source(&self) -> Option<SourceType> {
        self.source_type.parse().ok()
    }

    /// Looks up a custom field such as `job_id`.
    #[must_use]
    pub fn custom_field(&self, key: &str) -> Option<&str> {
        self.custom_fields.get(key).map(String::as_str)
    }
}

/// Accepts non-string values in `custom_fields` by keeping their JSON text.
fn deserialize_custom_fields<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Generates a 36 character lowercase hex event ID from 18 random bytes.
pub fn generate_event_id() -> String {
    let bytes: [u8; EVENT_ID_BYTES] = rand::rng().random();
    bytes.iter().fold(
        String::with_capacity(EVENT_ID_BYTES * 2),
        |mut id, byte| {
            id.push_str(&format!("{byte:02x}"));
            id
        },
    )
}

/// Current time as floating point seconds since the epoch.
pub(crate) fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
pub(crate) fn local_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_is_36_hex_chars() {
        let id = generate_event_id();
        assert_eq!(id.len(), 36);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn event_ids_differ() {
        assert_ne!(generate_event_id(), generate_event_id());
    }

    #[test]
    fn source_type_round_trips_through_str() {
        for source in SourceType::ALL {
            assert_eq!(source.as_str().parse::<SourceType>().unwrap(), source);
        }
        assert_eq!("gcs".parse::<SourceType>().unwrap(), SourceType::Gcs);
        assert_eq!(
            "NOPE".parse::<SourceType>().unwrap_err(),
            UnknownSourceType("NOPE".to_string())
        );
    }

    #[test]
    fn source_type_log_file_name() {
        assert_eq!(SourceType::CoreWorker.log_file_name(), "event_CORE_WORKER.log");
    }

    #[test]
    fn severity_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"WARNING\"");
        assert_eq!(
            serde_json::from_str::<Severity>("\"FATAL\"").unwrap(),
            Severity::Fatal
        );
        assert_eq!(Severity::Debug.to_string(), "DEBUG");
    }

    #[test]
    fn record_serializes_snake_case_fields() {
        let mut record = EventRecord::new(SourceType::Jobs, Severity::Info, "started");
        record
            .custom_fields
            .insert("job_id".to_string(), "01000000".to_string());

        let value = serde_json::to_value(&record).unwrap();
        for key in [
            "event_id",
            "source_type",
            "host_name",
            "pid",
            "label",
            "message",
            "time_stamp",
            "severity",
            "custom_fields",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["custom_fields"]["job_id"], "01000000");
    }

    #[test]
    fn record_accepts_writer_aliases_and_defaults() {
        let line = r#"{"event_id":"abc","source_type":"GCS","source_hostname":"h1","source_pid":7,"message":"m","timestamp":1.5,"severity":"ERROR"}"#;
        let record: EventRecord = serde_json::from_str(line).unwrap();

        assert_eq!(record.host_name, "h1");
        assert_eq!(record.pid, 7);
        assert_eq!(record.time_stamp, 1.5);
        assert!(record.label.is_empty());
        assert!(record.custom_fields.is_empty());
        assert_eq!(record.source(), Some(SourceType::Gcs));
    }

    #[test]
    fn custom_fields_keep_non_string_values_as_json_text() {
        let line = r#"{"event_id":"abc","source_type":"X","message":"m","time_stamp":1,"severity":"INFO","custom_fields":{"n":3,"b":true,"z":null,"s":"v"}}"#;
        let record: EventRecord = serde_json::from_str(line).unwrap();

        assert_eq!(record.custom_field("n"), Some("3"));
        assert_eq!(record.custom_field("b"), Some("true"));
        assert_eq!(record.custom_field("z"), Some(""));
        assert_eq!(record.custom_field("s"), Some("v"));
        assert_eq!(record.source(), None);
    }
}

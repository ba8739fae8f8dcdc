//! Line decoding for the monitor pipeline.
//!
//! The monitor loop is generic over a [`LineDecoder`]. Two decoders ship with
//! the crate:
//!
//! - [`EventParser`] turns each line into an [`EventRecord`].
//! - [`RawLines`] passes lines through untouched, for consumers that do their
//!   own decoding.
//!
//! Decode failures are classified so that diagnostics can tell syntactically
//! broken lines from well-formed JSON that is not an event record.

use serde_json::error::Category;
use thiserror::Error;

use crate::types::EventRecord;

/// Errors that can occur while decoding a line.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The line is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The line is valid JSON but lacks a required field or has a field of
    /// the wrong type.
    #[error("invalid event record: {0}")]
    InvalidRecord(#[source] serde_json::Error),

    /// The record carries an empty `event_id`, which consumers cannot
    /// de-duplicate on.
    #[error("event record has an empty event_id")]
    EmptyEventId,
}

impl ParseError {
    /// Short, stable name of the failure class for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::InvalidRecord(_) => "invalid_record",
            Self::EmptyEventId => "empty_event_id",
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => Self::InvalidRecord(err),
            Category::Syntax | Category::Eof | Category::Io => Self::InvalidJson(err),
        }
    }
}

/// Turns one raw line into a value delivered to consumers.
pub trait LineDecoder: Send + 'static {
    /// The decoded value.
    type Output: Send + 'static;

    /// Decodes a line whose trailing newline has already been stripped.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the line cannot be decoded; the monitor
    /// drops the line and moves on.
    fn decode(&mut self, line: &str) -> Result<Self::Output, ParseError>;
}

/// Decoder that yields each line unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawLines;

impl LineDecoder for RawLines {
    type Output = String;

    fn decode(&mut self, line: &str) -> Result<String, ParseError> {
        Ok(line.to_string())
    }
}

/// Decoder that parses each line as an [`EventRecord`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EventParser;

impl EventParser {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parses a single event line.
    ///
    /// # Errors
    ///
    /// See [`ParseError`].
    ///
    /// # Examples
    ///
    /// ```
    /// use event_monitor::parser::EventParser;
    ///
    /// let line = r#"{"event_id":"a1","source_type":"GCS","message":"hi","time_stamp":1.0,"severity":"INFO"}"#;
    /// let record = EventParser::new().parse_line(line).unwrap();
    /// assert_eq!(record.message, "hi");
    /// ```
    pub fn parse_line(&self, line: &str) -> Result<EventRecord, ParseError> {
        let record: EventRecord = serde_json::from_str(line)?;
        if record.event_id.is_empty() {
            return Err(ParseError::EmptyEventId);
        }
        Ok(record)
    }
}

impl LineDecoder for EventParser {
    type Output = EventRecord;

    fn decode(&mut self, line: &str) -> Result<EventRecord, ParseError> {
        self.parse_line(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SourceType};

    const VALID: &str = r#"{"event_id":"0a1b","source_type":"RAYLET","host_name":"node-1","pid":42,"label":"","message":"worker started","time_stamp":1700000000.25,"severity":"WARNING","custom_fields":{"job_id":"02000000","node_id":""}}"#;

    #[test]
    fn parses_complete_record() {
        let record = EventParser::new().parse_line(VALID).unwrap();

        assert_eq!(record.event_id, "0a1b");
        assert_eq!(record.source(), Some(SourceType::Raylet));
        assert_eq!(record.host_name, "node-1");
        assert_eq!(record.pid, 42);
        assert_eq!(record.message, "worker started");
        assert_eq!(record.time_stamp, 1_700_000_000.25);
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.custom_field("job_id"), Some("02000000"));
    }

    #[test]
    fn unknown_source_type_is_still_accepted() {
        let line = VALID.replace("RAYLET", "SOMETHING_NEW");
        let record = EventParser::new().parse_line(&line).unwrap();
        assert_eq!(record.source_type, "SOMETHING_NEW");
        assert_eq!(record.source(), None);
    }

    #[test]
    fn syntax_errors_are_invalid_json() {
        let err = EventParser::new().parse_line("{not json").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
        assert_eq!(err.kind(), "invalid_json");

        let err = EventParser::new().parse_line("7").unwrap_err();
        assert!(matches!(err, ParseError::InvalidRecord(_)));
    }

    #[test]
    fn missing_required_field_is_invalid_record() {
        let line = r#"{"event_id":"a","source_type":"GCS","time_stamp":1.0,"severity":"INFO"}"#;
        let err = EventParser::new().parse_line(line).unwrap_err();

        assert!(matches!(err, ParseError::InvalidRecord(_)));
        assert!(err.to_string().contains("message"));
    }

    #[test]
    fn unknown_severity_is_invalid_record() {
        let line = VALID.replace("WARNING", "LOUD");
        let err = EventParser::new().parse_line(&line).unwrap_err();
        assert_eq!(err.kind(), "invalid_record");
    }

    #[test]
    fn empty_event_id_rejected() {
        let line = VALID.replace("0a1b", "");
        let err = EventParser::new().parse_line(&line).unwrap_err();
        assert!(matches!(err, ParseError::EmptyEventId));
    }

    #[test]
    fn raw_lines_pass_through() {
        let mut decoder = RawLines;
        assert_eq!(decoder.decode("not json at all").unwrap(), "not json at all");
    }

    #[test]
    fn event_parser_as_decoder() {
        let mut decoder = EventParser;
        assert!(decoder.decode(VALID).is_ok());
        assert!(decoder.decode("").is_err());
    }
}

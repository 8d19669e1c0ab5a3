//! Line parsing for web-access log records.
//!
//! Records are seven whitespace-delimited tokens:
//! `ip_address iso8601_timestamp method path response_code response_time_ms session_id`.
//! A malformed record fails only itself; callers count the error and move on.

use chrono::DateTime;
use thiserror::Error;

use super::Event;

/// Number of tokens in a well-formed record.
const FIELD_COUNT: usize = 7;

/// Errors that can occur while parsing a single record.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("expected 7 fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid timestamp {raw:?}: {source}")]
    InvalidTimestamp {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("invalid {field} {raw:?}")]
    InvalidInteger { field: &'static str, raw: String },

    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

impl ParseError {
    /// Returns a short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FieldCount { .. } => "field_count",
            Self::InvalidTimestamp { .. } => "timestamp",
            Self::InvalidInteger { .. } => "integer",
            Self::InvalidUtf8(_) => "utf8",
        }
    }
}

/// Parse one text record into an [`Event`].
pub fn parse_line(line: &str) -> Result<Event, ParseError> {
    let mut fields: [&str; FIELD_COUNT] = [""; FIELD_COUNT];
    let mut found = 0usize;

    for token in line.split_whitespace() {
        if let Some(slot) = fields.get_mut(found) {
            *slot = token;
        }
        found += 1;
    }

    if found != FIELD_COUNT {
        return Err(ParseError::FieldCount { found });
    }

    let [source_address, timestamp, method, path, response_code, response_time, session_id] =
        fields;

    let event_time = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|source| ParseError::InvalidTimestamp {
            raw: timestamp.to_string(),
            source,
        })?
        .timestamp_millis();

    let response_code = response_code
        .parse::<u16>()
        .map_err(|_| ParseError::InvalidInteger {
            field: "response_code",
            raw: response_code.to_string(),
        })?;

    let response_time_ms =
        response_time
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidInteger {
                field: "response_time_ms",
                raw: response_time.to_string(),
            })?;

    Ok(Event {
        source_address: source_address.to_string(),
        event_time,
        method: method.to_string(),
        path: path.to_string(),
        response_code,
        response_time_ms,
        session_id: session_id.to_string(),
    })
}

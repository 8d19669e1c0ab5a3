pub mod parse;
pub mod stats;

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// One parsed web-access log line.
///
/// Values are immutable once parsed; pipelines share a single instance
/// behind an `Arc` and drop it after every metric has seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source_address: String,
    /// Request time as milliseconds since the Unix epoch.
    pub event_time: i64,
    pub method: String,
    pub path: String,
    pub response_code: u16,
    pub response_time_ms: u64,
    pub session_id: String,
}

impl Event {
    /// Returns true when the response code signals a client or server error.
    pub fn is_error(&self, threshold: u16) -> bool {
        self.response_code >= threshold
    }

    /// Formats the event back into the whitespace-delimited line format.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.source_address,
            format_event_time(self.event_time),
            self.method,
            self.path,
            self.response_code,
            self.response_time_ms,
            self.session_id,
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ source = {}, time = {}, method = {}, path = {}, code = {}, \
             response_time_ms = {}, session = {} }}",
            self.source_address,
            format_event_time(self.event_time),
            self.method,
            self.path,
            self.response_code,
            self.response_time_ms,
            self.session_id,
        )
    }
}

/// Formats epoch millis as an RFC 3339 UTC timestamp with millisecond precision.
pub fn format_event_time(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

use std::fmt;

use serde::Serialize;

/// The four metrics every output row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    ActiveSession,
    SubPerSecond,
    RequestPerSecond,
    ErrorPerSecond,
}

impl MetricKind {
    pub const COUNT: usize = 4;

    pub const ALL: [MetricKind; Self::COUNT] = [
        MetricKind::ActiveSession,
        MetricKind::SubPerSecond,
        MetricKind::RequestPerSecond,
        MetricKind::ErrorPerSecond,
    ];

    /// Stable position used for fixed-size per-metric arrays.
    pub fn index(self) -> usize {
        match self {
            MetricKind::ActiveSession => 0,
            MetricKind::SubPerSecond => 1,
            MetricKind::RequestPerSecond => 2,
            MetricKind::ErrorPerSecond => 3,
        }
    }

    /// Column name, also used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::ActiveSession => "active_session",
            MetricKind::SubPerSecond => "sub_per_second",
            MetricKind::RequestPerSecond => "request_per_second",
            MetricKind::ErrorPerSecond => "error_per_second",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(bucket, value)` pair produced by a timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub bucket: i64,
    pub kind: MetricKind,
    pub value: u64,
}

/// Consolidated metrics for one bucket, keyed by `bucket` on the sink side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricRow {
    #[serde(rename = "timestamp")]
    pub bucket: i64,
    pub active_session: u64,
    pub sub_per_second: u64,
    pub request_per_second: u64,
    pub error_per_second: u64,
}

impl MetricRow {
    /// Empty row with every metric at zero.
    pub fn new(bucket: i64) -> Self {
        Self {
            bucket,
            ..Self::default()
        }
    }

    pub fn get(&self, kind: MetricKind) -> u64 {
        match kind {
            MetricKind::ActiveSession => self.active_session,
            MetricKind::SubPerSecond => self.sub_per_second,
            MetricKind::RequestPerSecond => self.request_per_second,
            MetricKind::ErrorPerSecond => self.error_per_second,
        }
    }

    fn slot_mut(&mut self, kind: MetricKind) -> &mut u64 {
        match kind {
            MetricKind::ActiveSession => &mut self.active_session,
            MetricKind::SubPerSecond => &mut self.sub_per_second,
            MetricKind::RequestPerSecond => &mut self.request_per_second,
            MetricKind::ErrorPerSecond => &mut self.error_per_second,
        }
    }

    /// Merges `value` into `kind`, keeping the larger of old and new.
    ///
    /// Returns true when the stored value changed.
    pub fn merge(&mut self, kind: MetricKind, value: u64) -> bool {
        let slot = self.slot_mut(kind);
        if value > *slot {
            *slot = value;
            true
        } else {
            false
        }
    }
}

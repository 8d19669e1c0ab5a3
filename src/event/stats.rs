use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::metric::MetricKind;

/// Lock-free ingest counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct IngestStats {
    received: AtomicU64,
    parse_errors: AtomicU64,
    stale_sessions: AtomicU64,
    late: [AtomicU64; MetricKind::COUNT],
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub received: u64,
    pub parse_errors: u64,
    pub stale_sessions: u64,
    pub late: [u64; MetricKind::COUNT],
}

impl IngestSnapshot {
    /// Total late events across all counters.
    pub fn late_total(&self) -> u64 {
        self.late.iter().sum()
    }

    /// Returns true when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.received == 0
            && self.parse_errors == 0
            && self.stale_sessions == 0
            && self.late_total() == 0
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            stale_sessions: AtomicU64::new(0),
            late: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An event too old to refresh its session.
    pub fn record_stale_session(&self) {
        self.stale_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// An event outside the pending bucket of the given counter.
    pub fn record_late(&self, kind: MetricKind) {
        if let Some(counter) = self.late.get(kind.index()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.swap(0, Ordering::Relaxed),
            parse_errors: self.parse_errors.swap(0, Ordering::Relaxed),
            stale_sessions: self.stale_sessions.swap(0, Ordering::Relaxed),
            late: std::array::from_fn(|i| {
                self.late
                    .get(i)
                    .map(|c| c.swap(0, Ordering::Relaxed))
                    .unwrap_or(0)
            }),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = IngestStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_parse_error();
        stats.record_late(MetricKind::SubPerSecond);
        stats.record_late(MetricKind::SubPerSecond);
        stats.record_late(MetricKind::ErrorPerSecond);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.late[MetricKind::SubPerSecond.index()], 2);
        assert_eq!(snap.late[MetricKind::ErrorPerSecond.index()], 1);
        assert_eq!(snap.late_total(), 3);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = IngestStats::new();
        stats.record_stale_session();

        let first = stats.snapshot();
        assert_eq!(first.stale_sessions, 1);
        assert!(!first.is_empty());

        let second = stats.snapshot();
        assert!(second.is_empty());
    }
}

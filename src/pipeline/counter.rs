use crate::clock::{floor_to_interval, SchedulerError, TickScheduler};
use crate::event::Event;

use super::metric::{Emission, MetricKind};
use super::{Aggregator, IngestOutcome};

/// Inclusion test applied before an event is counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Count every event.
    All,
    /// Count events whose path starts with the prefix.
    PathPrefix(String),
    /// Count events whose response code is at least the threshold.
    MinResponseCode(u16),
}

impl Predicate {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Predicate::All => true,
            Predicate::PathPrefix(prefix) => event.path.starts_with(prefix.as_str()),
            Predicate::MinResponseCode(threshold) => event.is_error(*threshold),
        }
    }
}

/// Per-interval event counter over one tumbling window.
///
/// Only events whose timestamp falls in the pending bucket
/// `(fire - interval, fire]` are counted; anything else is reported as
/// late and dropped.
#[derive(Debug)]
pub struct TumblingCounter {
    kind: MetricKind,
    predicate: Predicate,
    count: u64,
    scheduler: TickScheduler,
}

impl TumblingCounter {
    pub fn new(
        kind: MetricKind,
        predicate: Predicate,
        interval_ms: i64,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            kind,
            predicate,
            count: 0,
            scheduler: TickScheduler::new(interval_ms)?,
        })
    }

    /// Counter for every request.
    pub fn requests(interval_ms: i64) -> Result<Self, SchedulerError> {
        Self::new(MetricKind::RequestPerSecond, Predicate::All, interval_ms)
    }

    /// Counter for requests under `prefix`.
    pub fn sub_pages(prefix: &str, interval_ms: i64) -> Result<Self, SchedulerError> {
        Self::new(
            MetricKind::SubPerSecond,
            Predicate::PathPrefix(prefix.to_string()),
            interval_ms,
        )
    }

    /// Counter for responses at or above `threshold`.
    pub fn errors(threshold: u16, interval_ms: i64) -> Result<Self, SchedulerError> {
        Self::new(
            MetricKind::ErrorPerSecond,
            Predicate::MinResponseCode(threshold),
            interval_ms,
        )
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Current accumulator value for the pending bucket.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn ingest(&mut self, event: &Event, now: i64) -> Result<IngestOutcome, SchedulerError> {
        self.scheduler.on_tick(now)?;

        if !self.predicate.matches(event) {
            return Ok(IngestOutcome::Filtered);
        }

        if !self.scheduler.in_pending_window(event.event_time) {
            return Ok(IngestOutcome::Late);
        }

        self.count += 1;
        Ok(IngestOutcome::Accepted)
    }

    /// Emits the accumulated count for the bucket of `fire_at`, resets and
    /// re-arms.
    pub fn on_timer(&mut self, fire_at: i64) -> Result<Emission, SchedulerError> {
        let value = std::mem::take(&mut self.count);
        self.scheduler.fire(fire_at)?;

        Ok(Emission {
            bucket: floor_to_interval(fire_at, self.scheduler.interval_ms()),
            kind: self.kind,
            value,
        })
    }
}

impl Aggregator for TumblingCounter {
    fn kind(&self) -> MetricKind {
        self.kind
    }

    fn ingest(&mut self, event: &Event, now: i64) -> Result<IngestOutcome, SchedulerError> {
        TumblingCounter::ingest(self, event, now)
    }

    fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    fn on_timer(&mut self, fire_at: i64, _now: i64) -> Result<Emission, SchedulerError> {
        TumblingCounter::on_timer(self, fire_at)
    }

    fn shutdown(&mut self) {
        self.scheduler.cancel();
    }
}

use std::collections::HashMap;

use crate::clock::{floor_to_interval, SchedulerError, TickScheduler};
use crate::event::Event;

use super::metric::{Emission, MetricKind};
use super::{Aggregator, IngestOutcome};

/// Default liveness window for a session: 30 seconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: i64 = 30_000;

/// How long expired session entries stay in memory.
///
/// Retention only bounds memory. The active count always applies the
/// session timeout, so purging never changes what is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionRetention {
    /// Never purge; expired entries are only excluded from the count.
    #[default]
    KeepAll,
    /// Purge entries last seen more than this many milliseconds ago.
    EvictAfter(i64),
}

impl SessionRetention {
    /// Purge horizon, clamped so a live session is never dropped.
    fn horizon(self, timeout_ms: i64) -> Option<i64> {
        match self {
            SessionRetention::KeepAll => None,
            SessionRetention::EvictAfter(ms) => Some(ms.max(timeout_ms)),
        }
    }
}

/// Tracks per-session liveness and emits the active session count once
/// per interval.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, i64>,
    scheduler: TickScheduler,
    timeout_ms: i64,
    retention: SessionRetention,
}

impl SessionRegistry {
    pub fn new(
        interval_ms: i64,
        timeout_ms: i64,
        retention: SessionRetention,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            sessions: HashMap::new(),
            scheduler: TickScheduler::new(interval_ms)?,
            timeout_ms,
            retention,
        })
    }

    /// Number of entries held in memory, live or expired.
    pub fn tracked(&self) -> usize {
        self.sessions.len()
    }

    pub fn last_seen(&self, session_id: &str) -> Option<i64> {
        self.sessions.get(session_id).copied()
    }

    fn is_live(&self, last_seen: i64, now: i64) -> bool {
        now.saturating_sub(last_seen) <= self.timeout_ms
    }

    /// Sessions whose last event is within the timeout as of `now`.
    pub fn active(&self, now: i64) -> u64 {
        self.sessions
            .values()
            .filter(|last_seen| self.is_live(**last_seen, now))
            .count() as u64
    }

    /// Records the event's session unless the event is already older than
    /// the timeout. Arms the timer on first use either way.
    pub fn ingest(&mut self, event: &Event, now: i64) -> Result<IngestOutcome, SchedulerError> {
        self.scheduler.on_tick(now)?;

        if !self.is_live(event.event_time, now) {
            return Ok(IngestOutcome::Stale);
        }

        // Out-of-order events never move a session's last_seen backwards.
        match self.sessions.get_mut(event.session_id.as_str()) {
            Some(last_seen) => *last_seen = (*last_seen).max(event.event_time),
            None => {
                self.sessions
                    .insert(event.session_id.clone(), event.event_time);
            }
        }

        Ok(IngestOutcome::Accepted)
    }

    /// Counts live sessions as of `now`, emits the count for the bucket of
    /// `fire_at` and re-arms.
    pub fn on_timer(&mut self, fire_at: i64, now: i64) -> Result<Emission, SchedulerError> {
        let value = self.active(now);
        self.scheduler.fire(fire_at)?;

        Ok(Emission {
            bucket: floor_to_interval(fire_at, self.scheduler.interval_ms()),
            kind: MetricKind::ActiveSession,
            value,
        })
    }

    /// Drops entries past the retention horizon. Returns how many were removed.
    pub fn compact(&mut self, now: i64) -> usize {
        let Some(horizon) = self.retention.horizon(self.timeout_ms) else {
            return 0;
        };

        let before = self.sessions.len();
        self.sessions
            .retain(|_, last_seen| now.saturating_sub(*last_seen) <= horizon);
        before - self.sessions.len()
    }
}

impl Aggregator for SessionRegistry {
    fn kind(&self) -> MetricKind {
        MetricKind::ActiveSession
    }

    fn ingest(&mut self, event: &Event, now: i64) -> Result<IngestOutcome, SchedulerError> {
        SessionRegistry::ingest(self, event, now)
    }

    fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    fn on_timer(&mut self, fire_at: i64, now: i64) -> Result<Emission, SchedulerError> {
        SessionRegistry::on_timer(self, fire_at, now)
    }

    fn shutdown(&mut self) {
        self.scheduler.cancel();
    }

    fn compact(&mut self, now: i64) -> usize {
        SessionRegistry::compact(self, now)
    }

    fn tracked(&self) -> usize {
        SessionRegistry::tracked(self)
    }
}

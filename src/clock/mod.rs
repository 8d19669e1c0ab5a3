//! Processing-time clock and the per-aggregator tick scheduler.
//!
//! Bucket boundaries are defined by the wall clock the engine observes, not
//! by timestamps embedded in events. Every aggregator owns one
//! [`TickScheduler`]; once armed it re-arms itself after every firing until
//! it is cancelled.

use std::fmt;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Default emission interval: one second.
pub const DEFAULT_INTERVAL_MS: i64 = 1_000;

/// Source of processing time in epoch milliseconds.
pub trait WallClock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Wall clock driven by the tokio timer, anchored at `base_millis`.
///
/// Follows `tokio::time::pause`/`advance`, which makes timer firings
/// deterministic in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_millis: i64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base_millis: i64) -> Self {
        Self {
            base_millis,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for TokioClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_millis.saturating_add(elapsed)
    }
}

/// Errors raised when a timer cannot be armed.
///
/// Any of these is fatal for the owning pipeline: without a pending timer
/// no further emissions would ever happen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("interval must be positive, got {interval_ms} ms")]
    InvalidInterval { interval_ms: i64 },

    #[error("next fire time after {after} ms overflows")]
    Overflow { after: i64 },

    #[error("scheduler cancelled")]
    Cancelled,
}

/// Rounds `ts` down to the start of its interval.
pub fn floor_to_interval(ts: i64, interval_ms: i64) -> i64 {
    ts - ts.rem_euclid(interval_ms)
}

/// Returns the first interval boundary strictly after `now`.
pub fn next_boundary(now: i64, interval_ms: i64) -> Option<i64> {
    floor_to_interval(now, interval_ms).checked_add(interval_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed { fire_at: i64 },
    Cancelled,
}

/// Self-perpetuating one-tick-per-interval timer.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    interval_ms: i64,
    state: TimerState,
}

impl TickScheduler {
    pub fn new(interval_ms: i64) -> Result<Self, SchedulerError> {
        if interval_ms <= 0 {
            return Err(SchedulerError::InvalidInterval { interval_ms });
        }

        Ok(Self {
            interval_ms,
            state: TimerState::Idle,
        })
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Fire time of the pending timer, if armed.
    pub fn pending(&self) -> Option<i64> {
        match self.state {
            TimerState::Armed { fire_at } => Some(fire_at),
            _ => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TimerState::Cancelled
    }

    /// Arms the timer at the next boundary after `now` when nothing is pending.
    ///
    /// Returns the fire time only when this call armed the timer.
    pub fn on_tick(&mut self, now: i64) -> Result<Option<i64>, SchedulerError> {
        match self.state {
            TimerState::Idle => {
                let fire_at = next_boundary(now, self.interval_ms)
                    .ok_or(SchedulerError::Overflow { after: now })?;
                self.state = TimerState::Armed { fire_at };
                Ok(Some(fire_at))
            }
            TimerState::Armed { .. } => Ok(None),
            TimerState::Cancelled => Err(SchedulerError::Cancelled),
        }
    }

    /// Returns the pending fire time once `now` has reached it.
    pub fn due(&self, now: i64) -> Option<i64> {
        self.pending().filter(|fire_at| now >= *fire_at)
    }

    /// Records a firing at `fire_at` and re-arms for the following interval.
    pub fn fire(&mut self, fire_at: i64) -> Result<i64, SchedulerError> {
        if self.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let next = fire_at
            .checked_add(self.interval_ms)
            .ok_or(SchedulerError::Overflow { after: fire_at })?;
        self.state = TimerState::Armed { fire_at: next };
        Ok(next)
    }

    /// Drops the pending timer; the scheduler never fires again.
    pub fn cancel(&mut self) {
        self.state = TimerState::Cancelled;
    }

    /// Whether `ts` falls in the pending bucket `(fire - interval, fire]`.
    pub fn in_pending_window(&self, ts: i64) -> bool {
        match self.pending() {
            Some(fire_at) => ts > fire_at - self.interval_ms && ts <= fire_at,
            None => false,
        }
    }

    /// Converts the pending fire time into a tokio deadline using `clock`.
    pub fn deadline(&self, clock: &dyn WallClock) -> Option<tokio::time::Instant> {
        let fire_at = self.pending()?;
        let wait_ms = fire_at.saturating_sub(clock.now_millis()).max(0);
        let wait = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
        Some(tokio::time::Instant::now() + wait)
    }
}

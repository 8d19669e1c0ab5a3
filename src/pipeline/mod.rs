//! Windowed keyed-state aggregation.
//!
//! Every metric runs as its own single-owner actor: one task holds the
//! aggregator state and serializes event ingestion with timer firings.
//! Emissions fan in over one channel to the merger actor, which forwards a
//! row snapshot to the sink after every merge.
//!
//! Shutdown cancels the pipelines first. Once they are gone the emission
//! channel closes, the merger drains what is queued and drops its sink
//! handle, and the row writer flushes.

pub mod counter;
pub mod merger;
pub mod metric;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{SchedulerError, TickScheduler, WallClock};
use crate::config::AggregationConfig;
use crate::event::parse::{parse_line, ParseError};
use crate::event::stats::IngestStats;
use crate::event::Event;
use crate::export::health::HealthMetrics;
use crate::sink::SinkAdapter;

use counter::TumblingCounter;
use merger::MetricMerger;
use metric::{Emission, MetricKind};
use session::{SessionRegistry, SessionRetention};

/// What an aggregator did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Recorded in the aggregator state.
    Accepted,
    /// Rejected by the counter's predicate.
    Filtered,
    /// Too old to refresh its session.
    Stale,
    /// Outside the counter's pending bucket.
    Late,
}

/// Keyed state machine driven by events and its own timer.
pub trait Aggregator: Send + 'static {
    fn kind(&self) -> MetricKind;

    /// Applies one event observed at processing time `now`.
    fn ingest(&mut self, event: &Event, now: i64) -> Result<IngestOutcome, SchedulerError>;

    fn scheduler(&self) -> &TickScheduler;

    /// Emits the value for the bucket ending at `fire_at` and re-arms.
    fn on_timer(&mut self, fire_at: i64, now: i64) -> Result<Emission, SchedulerError>;

    /// Cancels the pending timer.
    fn shutdown(&mut self);

    /// Purges expired state. Returns the number of entries removed.
    fn compact(&mut self, _now: i64) -> usize {
        0
    }

    /// Entries currently held in memory.
    fn tracked(&self) -> usize {
        0
    }
}

/// Running aggregation engine: four metric pipelines and the merger.
pub struct Engine {
    input: EngineInput,
    cancel: CancellationToken,
    supervisor: JoinHandle<Result<()>>,
}

/// Cloneable ingest side of an [`Engine`].
#[derive(Clone)]
pub struct EngineInput {
    inputs: Vec<mpsc::Sender<Arc<Event>>>,
    stats: Arc<IngestStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl Engine {
    /// Spawns the pipelines and the merger.
    ///
    /// The engine stops when `cancel` fires, when [`Engine::shutdown`] is
    /// called, or when any pipeline fails to arm its timer.
    pub fn start(
        cfg: &AggregationConfig,
        clock: Arc<dyn WallClock>,
        sink: SinkAdapter,
        stats: Arc<IngestStats>,
        health: Option<Arc<HealthMetrics>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let interval_ms = to_millis(cfg.interval).context("aggregation.interval")?;
        let timeout_ms = to_millis(cfg.session_timeout).context("aggregation.session_timeout")?;
        let retention = match cfg.session_retention {
            Some(after) => SessionRetention::EvictAfter(
                to_millis(after).context("aggregation.session_retention")?,
            ),
            None => SessionRetention::KeepAll,
        };

        let sessions = SessionRegistry::new(interval_ms, timeout_ms, retention)
            .context("creating session registry")?;
        let sub_pages = TumblingCounter::sub_pages(&cfg.sub_path_prefix, interval_ms)
            .context("creating sub-page counter")?;
        let requests =
            TumblingCounter::requests(interval_ms).context("creating request counter")?;
        let errors = TumblingCounter::errors(cfg.error_status_threshold, interval_ms)
            .context("creating error counter")?;

        let capacity = cfg.channel_capacity.max(1);
        let (emit_tx, emit_rx) = mpsc::channel(capacity);

        let ctx = PipelineContext {
            clock,
            emit_tx,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            health: health.clone(),
            compaction_interval: cfg.compaction_interval,
        };

        let mut pipelines = JoinSet::new();
        let inputs = vec![
            spawn_pipeline(&mut pipelines, sessions, ctx.clone(), capacity),
            spawn_pipeline(&mut pipelines, sub_pages, ctx.clone(), capacity),
            spawn_pipeline(&mut pipelines, requests, ctx.clone(), capacity),
            spawn_pipeline(&mut pipelines, errors, ctx, capacity),
        ];

        let merger = tokio::spawn(run_merger(
            MetricMerger::new(cfg.max_buckets),
            emit_rx,
            sink,
            health.clone(),
        ));

        let supervisor = tokio::spawn(supervise(pipelines, merger, cancel.clone(), health.clone()));

        info!(
            interval_ms,
            session_timeout_ms = timeout_ms,
            sub_path_prefix = %cfg.sub_path_prefix,
            error_status_threshold = cfg.error_status_threshold,
            "aggregation engine started",
        );

        Ok(Self {
            input: EngineInput {
                inputs,
                stats,
                health,
            },
            cancel,
            supervisor,
        })
    }

    /// Handle for feeding events from other tasks.
    pub fn input(&self) -> EngineInput {
        self.input.clone()
    }

    pub async fn ingest(&self, event: Event) -> Result<()> {
        self.input.ingest(event).await
    }

    pub async fn ingest_line(&self, line: &str) -> Result<()> {
        self.input.ingest_line(line).await
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.input.stats
    }

    /// Token cancelled when the engine stops for any reason.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels all timers and waits for the merger to drain.
    ///
    /// Returns the first pipeline failure, if any occurred.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Drops this handle's inputs and waits until the engine stops, which
    /// only happens through cancellation or a pipeline failure.
    pub async fn wait(self) -> Result<()> {
        let Engine {
            input, supervisor, ..
        } = self;

        drop(input);

        supervisor.await.context("engine supervisor panicked")?
    }
}

impl EngineInput {
    /// Fans one event out to every pipeline, waiting for queue space.
    pub async fn ingest(&self, event: Event) -> Result<()> {
        self.stats.record_received();
        if let Some(health) = &self.health {
            health.events_received.inc();
        }

        let event = Arc::new(event);
        for input in &self.inputs {
            input
                .send(Arc::clone(&event))
                .await
                .map_err(|_| anyhow!("aggregation engine stopped"))?;
        }

        Ok(())
    }

    /// Parses and ingests one raw line. Malformed lines are counted and skipped.
    pub async fn ingest_line(&self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }

        match parse_line(line) {
            Ok(event) => self.ingest(event).await,
            Err(e) => {
                self.discard(&e);
                debug!(error = %e, line, "discarding malformed line");
                Ok(())
            }
        }
    }

    /// Like [`EngineInput::ingest_line`] for a raw record. A record that is
    /// not valid UTF-8 counts as a parse error.
    pub async fn ingest_bytes(&self, raw: &[u8]) -> Result<()> {
        match std::str::from_utf8(raw) {
            Ok(line) => self.ingest_line(line).await,
            Err(e) => {
                let e = ParseError::from(e);
                self.discard(&e);
                debug!(error = %e, len = raw.len(), "discarding undecodable line");
                Ok(())
            }
        }
    }

    fn discard(&self, e: &ParseError) {
        self.stats.record_parse_error();
        if let Some(health) = &self.health {
            health
                .event_parse_errors
                .with_label_values(&[e.kind()])
                .inc();
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }
}

#[derive(Clone)]
struct PipelineContext {
    clock: Arc<dyn WallClock>,
    emit_tx: mpsc::Sender<Emission>,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
    health: Option<Arc<HealthMetrics>>,
    compaction_interval: Duration,
}

fn spawn_pipeline<A: Aggregator>(
    set: &mut JoinSet<(MetricKind, Result<()>)>,
    aggregator: A,
    ctx: PipelineContext,
    capacity: usize,
) -> mpsc::Sender<Arc<Event>> {
    let (tx, rx) = mpsc::channel(capacity);
    let kind = aggregator.kind();
    set.spawn(async move { (kind, run_pipeline(aggregator, rx, ctx).await) });
    tx
}

/// Single-owner event loop for one aggregator.
async fn run_pipeline<A: Aggregator>(
    mut aggregator: A,
    mut rx: mpsc::Receiver<Arc<Event>>,
    ctx: PipelineContext,
) -> Result<()> {
    let kind = aggregator.kind();
    let mut input_open = true;
    let mut compaction = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.compaction_interval,
        ctx.compaction_interval,
    );
    compaction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(metric = %kind, "pipeline started");

    let result = loop {
        let deadline = aggregator.scheduler().deadline(ctx.clock.as_ref());

        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => break Ok(()),

            _ = sleep_until(deadline) => {
                if let Err(e) = ctx.fire_due(&mut aggregator).await {
                    break Err(e);
                }
            }

            received = rx.recv(), if input_open => match received {
                Some(event) => {
                    if let Err(e) = ctx.ingest(&mut aggregator, &event) {
                        break Err(e);
                    }
                }
                None => {
                    // Timers keep running after the source is exhausted.
                    input_open = false;
                    debug!(metric = %kind, "pipeline input closed");
                }
            },

            _ = compaction.tick() => ctx.compact(&mut aggregator),
        }
    };

    aggregator.shutdown();
    debug!(metric = %kind, "pipeline stopped");

    result
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PipelineContext {
    fn ingest<A: Aggregator>(&self, aggregator: &mut A, event: &Event) -> Result<()> {
        let kind = aggregator.kind();
        let outcome = aggregator
            .ingest(event, self.clock.now_millis())
            .with_context(|| format!("arming {kind} timer"))?;

        match outcome {
            IngestOutcome::Late => {
                self.stats.record_late(kind);
                if let Some(health) = &self.health {
                    health.late_events.with_label_values(&[kind.as_str()]).inc();
                }
            }
            IngestOutcome::Stale => {
                self.stats.record_stale_session();
                if let Some(health) = &self.health {
                    health.stale_session_events.inc();
                }
            }
            IngestOutcome::Accepted | IngestOutcome::Filtered => {}
        }

        Ok(())
    }

    /// Fires every boundary the clock has reached, oldest first.
    async fn fire_due<A: Aggregator>(&self, aggregator: &mut A) -> Result<()> {
        let kind = aggregator.kind();
        let now = self.clock.now_millis();

        while let Some(fire_at) = aggregator.scheduler().due(now) {
            let emission = aggregator
                .on_timer(fire_at, now)
                .with_context(|| format!("re-arming {kind} timer after {fire_at}"))?;

            debug!(
                metric = %kind,
                bucket = emission.bucket,
                value = emission.value,
                "emitted",
            );

            if let Some(health) = &self.health {
                health.emissions.with_label_values(&[kind.as_str()]).inc();
                if kind == MetricKind::ActiveSession {
                    health.active_sessions.set(emission.value as f64);
                    health.sessions_tracked.set(aggregator.tracked() as f64);
                }
            }

            self.emit_tx
                .send(emission)
                .await
                .map_err(|_| anyhow!("merger stopped"))?;
        }

        Ok(())
    }

    fn compact<A: Aggregator>(&self, aggregator: &mut A) {
        let purged = aggregator.compact(self.clock.now_millis());
        if purged == 0 {
            return;
        }

        debug!(metric = %aggregator.kind(), purged, remaining = aggregator.tracked(), "compacted state");
        if let Some(health) = &self.health {
            health.sessions_evicted.inc_by(purged as f64);
            health.sessions_tracked.set(aggregator.tracked() as f64);
        }
    }
}

/// Single-owner merger: folds emissions into rows and forwards snapshots.
async fn run_merger(
    mut merger: MetricMerger,
    mut rx: mpsc::Receiver<Emission>,
    sink: SinkAdapter,
    health: Option<Arc<HealthMetrics>>,
) -> Result<()> {
    let mut evicted = 0;

    while let Some(emission) = rx.recv().await {
        let Some(row) = merger.ingest(emission) else {
            debug!(
                bucket = emission.bucket,
                metric = %emission.kind,
                "dropping emission for evicted bucket"
            );
            if let Some(health) = &health {
                health.merger_late_emissions.inc();
            }
            continue;
        };

        sink.upsert_row(row)
            .await
            .with_context(|| format!("forwarding row for bucket {}", row.bucket))?;

        if let Some(health) = &health {
            health.merger_buckets.set(merger.len() as f64);
            let newly_evicted = merger.evicted() - evicted;
            if newly_evicted > 0 {
                health.merger_buckets_evicted.inc_by(newly_evicted as f64);
            }
        }
        evicted = merger.evicted();
    }

    debug!(buckets = merger.len(), "merger drained");
    Ok(())
}

/// Waits for every pipeline, tearing the engine down on the first failure.
async fn supervise(
    mut pipelines: JoinSet<(MetricKind, Result<()>)>,
    merger: JoinHandle<Result<()>>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) -> Result<()> {
    let mut failure: Option<anyhow::Error> = None;

    while let Some(joined) = pipelines.join_next().await {
        let (kind, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "pipeline task panicked, stopping engine");
                cancel.cancel();
                failure.get_or_insert_with(|| anyhow!("pipeline task panicked: {e}"));
                continue;
            }
        };

        if let Err(e) = result {
            error!(metric = %kind, error = %format_args!("{e:#}"), "pipeline failed, stopping engine");
            if let Some(health) = &health {
                health.timer_failures.with_label_values(&[kind.as_str()]).inc();
            }
            cancel.cancel();
            failure.get_or_insert(e.context(format!("{kind} pipeline failed")));
        }
    }

    match merger.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %format_args!("{e:#}"), "merger failed");
            failure.get_or_insert(e);
        }
        Err(e) => {
            failure.get_or_insert_with(|| anyhow!("merger task panicked: {e}"));
        }
    }

    info!("aggregation engine stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn to_millis(d: Duration) -> Result<i64> {
    i64::try_from(d.as_millis()).context("duration out of range")
}

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::export::health::HealthMetrics;
use crate::pipeline::metric::MetricRow;

use super::exporter::Exporter;

/// Bounded retry policy with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &WriterConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            backoff: cfg.retry_backoff,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    /// Runs `op` until it succeeds or attempts run out.
    ///
    /// Returns the attempt count on success and the last error otherwise.
    pub async fn run<F, Fut>(
        &self,
        sink: &str,
        health: Option<&HealthMetrics>,
        mut op: F,
    ) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt < self.max_attempts => {
                    debug!(sink, attempt, error = %e, "export failed, retrying");
                    if let Some(health) = health {
                        health.export_retries.with_label_values(&[sink]).inc();
                    }
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("giving up after {attempt} attempts"))),
            }
        }
    }
}

/// Handle used by the merger to hand rows to the writer.
///
/// Sending waits while the writer's queue is full.
#[derive(Clone)]
pub struct SinkAdapter {
    tx: mpsc::Sender<MetricRow>,
    health: Option<Arc<HealthMetrics>>,
}

impl SinkAdapter {
    /// Queues one row snapshot for upsert.
    pub async fn upsert_row(&self, row: MetricRow) -> Result<()> {
        self.tx
            .send(row)
            .await
            .map_err(|_| anyhow!("row writer stopped"))?;

        if let Some(health) = &self.health {
            health.rows_forwarded.inc();
            let queued = self.tx.max_capacity() - self.tx.capacity();
            health.sink_queue_length.set(queued as f64);
        }

        Ok(())
    }
}

/// Spawns the writer task over already-started exporters.
///
/// The task runs until every [`SinkAdapter`] clone is dropped, then flushes
/// the pending batch and stops the exporters.
pub fn spawn_writer(
    cfg: WriterConfig,
    exporters: Vec<Exporter>,
    health: Option<Arc<HealthMetrics>>,
) -> (SinkAdapter, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(cfg.max_queue_size.max(1));

    let writer = RowWriter {
        policy: RetryPolicy::from_config(&cfg),
        cfg,
        exporters,
        rx,
        pending: BTreeMap::new(),
        health: health.clone(),
    };

    let handle = tokio::spawn(writer.run());

    (SinkAdapter { tx, health }, handle)
}

struct RowWriter {
    cfg: WriterConfig,
    policy: RetryPolicy,
    exporters: Vec<Exporter>,
    rx: mpsc::Receiver<MetricRow>,
    /// Latest snapshot per bucket awaiting flush.
    pending: BTreeMap<i64, MetricRow>,
    health: Option<Arc<HealthMetrics>>,
}

impl RowWriter {
    async fn run(mut self) {
        let names: Vec<&str> = self.exporters.iter().map(Exporter::name).collect();
        info!(
            exporters = ?names,
            batch_size = self.cfg.batch_size,
            flush_interval = ?self.cfg.flush_interval,
            "row writer started",
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.flush_interval,
            self.cfg.flush_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(row) => {
                        self.pending.insert(row.bucket, row);

                        // Drain more rows without blocking.
                        while self.pending.len() < self.cfg.batch_size {
                            match self.rx.try_recv() {
                                Ok(row) => {
                                    self.pending.insert(row.bucket, row);
                                }
                                Err(_) => break,
                            }
                        }

                        if self.pending.len() >= self.cfg.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;

        for exporter in &mut self.exporters {
            if let Err(e) = exporter.stop().await {
                warn!(sink = exporter.name(), error = %e, "error stopping exporter");
            }
        }

        info!("row writer stopped");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let rows: Vec<MetricRow> = std::mem::take(&mut self.pending).into_values().collect();

        for exporter in &self.exporters {
            let sink = exporter.name();
            let start = Instant::now();

            let result = self
                .policy
                .run(sink, self.health.as_deref(), || exporter.upsert_rows(&rows))
                .await;

            match result {
                Ok(attempts) => {
                    if let Some(health) = &self.health {
                        health
                            .sink_flush_duration
                            .with_label_values(&[sink])
                            .observe(start.elapsed().as_secs_f64());
                        health
                            .sink_batch_size
                            .with_label_values(&[sink])
                            .observe(rows.len() as f64);
                    }
                    debug!(sink, rows = rows.len(), attempts, "flushed rows");
                }
                Err(e) => {
                    if let Some(health) = &self.health {
                        health
                            .export_batch_errors
                            .with_label_values(&[sink, "retries_exhausted"])
                            .inc();
                    }
                    warn!(sink, rows = rows.len(), error = %e, "dropping batch after failed export");
                }
            }
        }
    }
}

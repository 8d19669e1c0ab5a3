use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::event::format_event_time;
use crate::pipeline::metric::MetricRow;

/// In-process upsert table keyed by bucket timestamp.
///
/// Used when no external sink is enabled, and by tests to observe what the
/// engine forwards. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    rows: Arc<Mutex<BTreeMap<i64, MetricRow>>>,
    upserts: Arc<AtomicU64>,
    log_rows: bool,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every upserted row at info level.
    pub fn with_logging(mut self) -> Self {
        self.log_rows = true;
        self
    }

    /// Stored row for `bucket`, if any.
    pub fn row(&self, bucket: i64) -> Option<MetricRow> {
        self.rows.lock().get(&bucket).copied()
    }

    /// All stored rows ordered by bucket.
    pub fn rows(&self) -> Vec<MetricRow> {
        self.rows.lock().values().copied().collect()
    }

    /// Number of row writes received, including overwrites.
    pub fn upserts(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        "memory"
    }

    pub async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn upsert_rows(&self, rows: &[MetricRow]) -> Result<()> {
        let mut table = self.rows.lock();
        for row in rows {
            table.insert(row.bucket, *row);

            if self.log_rows {
                tracing::info!(
                    ts = %format_event_time(row.bucket),
                    active_session = row.active_session,
                    sub_per_second = row.sub_per_second,
                    request_per_second = row.request_per_second,
                    error_per_second = row.error_per_second,
                    "stats",
                );
            }
        }
        self.upserts
            .fetch_add(rows.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

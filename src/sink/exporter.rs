use anyhow::Result;

use crate::pipeline::metric::MetricRow;

use super::clickhouse::ClickHouseExporter;
use super::http::HttpExporter;
use super::memory::MemoryExporter;

/// Exporter dispatches row batches to ClickHouse, HTTP or an in-memory table.
///
/// Uses enum dispatch rather than trait objects for zero-cost async dispatch
/// (avoids `Pin<Box<dyn Future>>` overhead on every export call).
pub enum Exporter {
    ClickHouse(ClickHouseExporter),
    Http(HttpExporter),
    Memory(MemoryExporter),
}

impl Exporter {
    /// Returns the exporter name for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(e) => e.name(),
            Self::Http(e) => e.name(),
            Self::Memory(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.start().await,
            Self::Http(e) => e.start().await,
            Self::Memory(e) => e.start().await,
        }
    }

    /// Upserts a batch of rows keyed by bucket timestamp.
    pub async fn upsert_rows(&self, rows: &[MetricRow]) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.upsert_rows(rows).await,
            Self::Http(e) => e.upsert_rows(rows).await,
            Self::Memory(e) => e.upsert_rows(rows).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.stop().await,
            Self::Http(e) => e.stop().await,
            Self::Memory(e) => e.stop().await,
        }
    }
}

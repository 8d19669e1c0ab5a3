use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;
use crate::pipeline::metric::MetricRow;

const COLUMNS: &str =
    "ts, active_session, sub_per_second, request_per_second, error_per_second, updated_date_time";

/// ClickHouse exporter for stats rows.
///
/// The target table is a `ReplacingMergeTree` ordered by `ts` and versioned
/// by `updated_date_time`, so repeated inserts for a bucket collapse to the
/// latest row.
pub struct ClickHouseExporter {
    pool: Pool,
    table: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseExporter {
    /// Creates an exporter writing to `table` (`database.table`).
    pub fn new(pool: Pool, table: String, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            table,
            health,
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Some(health) = &self.health {
            health
                .sink_connected
                .with_label_values(&[self.name()])
                .set(if connected { 1.0 } else { 0.0 });
        }
    }

    fn record_batch_error(&self, error_type: &str) {
        if let Some(health) = &self.health {
            health
                .export_batch_errors
                .with_label_values(&[self.name(), error_type])
                .inc();
        }
    }
}

// --- Exporter interface (called by Exporter enum dispatch) ---

impl ClickHouseExporter {
    pub fn name(&self) -> &'static str {
        "clickhouse"
    }

    /// The pool is opened by `ClickHouseConnection`; nothing to do here.
    pub async fn start(&mut self) -> Result<()> {
        self.set_connected(true);
        Ok(())
    }

    pub async fn upsert_rows(&self, rows: &[MetricRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = build_insert(&self.table, rows, Utc::now());

        let mut handle = match self.pool.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_connected(false);
                self.record_batch_error("connection");
                return Err(e).context("getting handle for stats insert");
            }
        };

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_batch_error("insert");
            return Err(e).with_context(|| format!("inserting {} rows into {}", rows.len(), self.table));
        }

        self.set_connected(true);
        tracing::debug!(rows = rows.len(), table = %self.table, "inserted stats rows");

        Ok(())
    }

    /// The pool is closed by `ClickHouseConnection`; nothing to do here.
    pub async fn stop(&mut self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}

// --- SQL formatting helpers ---

/// Builds one multi-row INSERT for `rows`, stamped with `updated`.
fn build_insert(table: &str, rows: &[MetricRow], updated: DateTime<Utc>) -> String {
    let updated = format_datetime(updated);
    let mut sql = String::with_capacity(64 + table.len() + COLUMNS.len() + rows.len() * 96);
    let _ = write!(sql, "INSERT INTO {table} ({COLUMNS}) VALUES ");

    for (idx, row) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let _ = write!(
            sql,
            "({}, {}, {}, {}, {}, {updated})",
            format_millis(row.bucket),
            row.active_session,
            row.sub_per_second,
            row.request_per_second,
            row.error_per_second,
        );
    }

    sql
}

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

fn format_millis(millis: i64) -> String {
    format_datetime(DateTime::from_timestamp_millis(millis).unwrap_or_default())
}

use std::io::Write;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::HttpExportConfig;
use crate::pipeline::metric::MetricRow;

/// JSON shape of one stats row, matching the ClickHouse table columns.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRowJson<'a> {
    pub ts: String,
    pub active_session: u64,
    pub sub_per_second: u64,
    pub request_per_second: u64,
    pub error_per_second: u64,
    pub updated_date_time: &'a str,
}

/// HTTP NDJSON exporter with optional compression.
///
/// Each batch handed over by the row writer becomes one POST; a failed
/// request surfaces as an error so the writer can retry it.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    client: Option<reqwest::Client>,
}

impl HttpExporter {
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self { cfg, client: None }
    }
}

// --- Exporter interface (called by Exporter enum dispatch) ---

impl HttpExporter {
    pub fn name(&self) -> &'static str {
        "http"
    }

    /// Builds the HTTP client.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.address.is_empty() {
            bail!("http address is required");
        }

        let mut builder = reqwest::Client::builder().timeout(self.cfg.export_timeout);
        if !self.cfg.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        self.client = Some(builder.build().context("building HTTP client")?);

        tracing::info!(
            address = %self.cfg.address,
            compression = %self.cfg.compression,
            "HTTP exporter started",
        );

        Ok(())
    }

    pub async fn upsert_rows(&self, rows: &[MetricRow]) -> Result<()> {
        let Some(client) = &self.client else {
            bail!("HTTP exporter not started");
        };
        if rows.is_empty() {
            return Ok(());
        }

        let body = encode_ndjson(rows, Utc::now())?;
        let raw_len = body.len();
        let compressed = compress(&body, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(rows = rows.len(), bytes = raw_len, "exported rows via HTTP");

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

/// Serializes rows as newline-delimited JSON.
fn encode_ndjson(rows: &[MetricRow], updated: DateTime<Utc>) -> Result<Vec<u8>> {
    let updated = format_datetime(updated);
    let mut buf = Vec::with_capacity(rows.len() * 160);

    for row in rows {
        let item = StatsRowJson {
            ts: format_datetime(DateTime::from_timestamp_millis(row.bucket).unwrap_or_default()),
            active_session: row.active_session,
            sub_per_second: row.sub_per_second,
            request_per_second: row.request_per_second,
            error_per_second: row.error_per_second,
            updated_date_time: &updated,
        };
        serde_json::to_writer(&mut buf, &item).context("serializing row to JSON")?;
        buf.push(b'\n');
    }

    Ok(buf)
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        "zstd" => zstd::encode_all(data, 0).context("zstd encode"),
        "zlib" => {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("zlib write")?;
            encoder.finish().context("zlib finish")
        }
        "snappy" => snap::raw::Encoder::new()
            .compress_vec(data)
            .context("snappy encode"),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

/// Formats a timestamp as "2006-01-02 15:04:05.000".
fn format_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

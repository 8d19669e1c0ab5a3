use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::DEFAULT_INTERVAL_MS;
use crate::pipeline::session::DEFAULT_SESSION_TIMEOUT_MS;

/// Top-level configuration for the clickstream aggregator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where raw log lines come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Windowing and retention settings for the aggregation engine.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Row sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic traffic generator settings.
    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// Kind of line source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Stdin,
    File,
    Tcp,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Source kind. Default: stdin.
    #[serde(default)]
    pub kind: SourceKind,

    /// File to read when `kind` is `file`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Listen address when `kind` is `tcp`. Default: "127.0.0.1:5140".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Aggregation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Emission interval and bucket width. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a session stays active after its last event. Default: 30s.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Path prefix counted by the sub-page metric. Default: "/sub".
    #[serde(default = "default_sub_path_prefix")]
    pub sub_path_prefix: String,

    /// Lowest response code counted as an error. Default: 400.
    #[serde(default = "default_error_status_threshold")]
    pub error_status_threshold: u16,

    /// Capacity of every internal channel. Default: 4096.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Purge expired session entries after this long. Default: never.
    #[serde(default, with = "humantime_serde")]
    pub session_retention: Option<Duration>,

    /// How often the session registry is compacted. Default: 60s.
    #[serde(default = "default_compaction_interval", with = "humantime_serde")]
    pub compaction_interval: Duration,

    /// Maximum buckets held by the merger. Default: unbounded.
    #[serde(default)]
    pub max_buckets: Option<usize>,
}

/// Row sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksConfig {
    /// Batching and retry policy shared by all exporters.
    #[serde(default)]
    pub writer: WriterConfig,

    /// ClickHouse exporter.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// HTTP NDJSON exporter.
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// Row writer batching and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Rows per batch. Default: 200.
    #[serde(default = "default_writer_batch_size")]
    pub batch_size: usize,

    /// Maximum time a row waits before its batch is flushed. Default: 200ms.
    #[serde(default = "default_writer_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Export attempts per batch before giving up. Default: 5.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, multiplied by the attempt number. Default: 100ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Rows queued ahead of the writer before callers wait. Default: 1024.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "stats".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// HTTP export configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send rows to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum duration for one request. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic traffic generator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Number of simulated users. Default: 15.
    #[serde(default = "default_generator_users")]
    pub users: usize,

    /// How long each user keeps producing lines. Default: 300s.
    #[serde(default = "default_generator_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Lower bound of the pause between lines. Default: 500ms.
    #[serde(default = "default_generator_min_sleep", with = "humantime_serde")]
    pub min_sleep: Duration,

    /// Upper bound of the pause between lines. Default: 60s.
    #[serde(default = "default_generator_max_sleep", with = "humantime_serde")]
    pub max_sleep: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:5140".to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(DEFAULT_INTERVAL_MS.unsigned_abs())
}

fn default_session_timeout() -> Duration {
    Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS.unsigned_abs())
}

fn default_sub_path_prefix() -> String {
    "/sub".to_string()
}

fn default_error_status_threshold() -> u16 {
    400
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_writer_batch_size() -> usize {
    200
}

fn default_writer_flush_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "stats".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_generator_users() -> usize {
    15
}

fn default_generator_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_generator_min_sleep() -> Duration {
    Duration::from_millis(500)
}

fn default_generator_max_sleep() -> Duration {
    Duration::from_secs(60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            aggregation: AggregationConfig::default(),
            sinks: SinksConfig::default(),
            health: HealthConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            path: None,
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            session_timeout: default_session_timeout(),
            sub_path_prefix: default_sub_path_prefix(),
            error_status_threshold: default_error_status_threshold(),
            channel_capacity: default_channel_capacity(),
            session_retention: None,
            compaction_interval: default_compaction_interval(),
            max_buckets: None,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_writer_batch_size(),
            flush_interval: default_writer_flush_interval(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            export_timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            users: default_generator_users(),
            duration: default_generator_duration(),
            min_sleep: default_generator_min_sleep(),
            max_sleep: default_generator_max_sleep(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.kind == SourceKind::File && self.source.path.is_none() {
            bail!("source.path is required for file sources");
        }

        if self.source.kind == SourceKind::Tcp && self.source.listen_addr.is_empty() {
            bail!("source.listen_addr is required for tcp sources");
        }

        let agg = &self.aggregation;
        if agg.interval.as_millis() == 0 {
            bail!("aggregation.interval must be at least 1ms");
        }
        if agg.session_timeout < agg.interval {
            bail!("aggregation.session_timeout must not be shorter than aggregation.interval");
        }
        if agg.channel_capacity == 0 {
            bail!("aggregation.channel_capacity must be positive");
        }
        if agg.compaction_interval.is_zero() {
            bail!("aggregation.compaction_interval must be positive");
        }
        if agg.max_buckets == Some(0) {
            bail!("aggregation.max_buckets must be positive when set");
        }

        let writer = &self.sinks.writer;
        if writer.batch_size == 0 {
            bail!("sinks.writer.batch_size must be positive");
        }
        if writer.max_queue_size == 0 {
            bail!("sinks.writer.max_queue_size must be positive");
        }
        if writer.max_retries == 0 {
            bail!("sinks.writer.max_retries must be at least 1");
        }
        if writer.flush_interval.is_zero() {
            bail!("sinks.writer.flush_interval must be positive");
        }

        if self.sinks.clickhouse.enabled && self.sinks.clickhouse.endpoint.is_empty() {
            bail!("clickhouse endpoint is required when enabled");
        }

        // Validate HTTP export config if enabled.
        if self.sinks.http.enabled {
            if self.sinks.http.address.is_empty() {
                bail!("http address is required when enabled");
            }

            let compression = &self.sinks.http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        if self.generator.min_sleep > self.generator.max_sleep {
            bail!("generator.min_sleep must not exceed generator.max_sleep");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.source.kind, SourceKind::Stdin);
        assert_eq!(cfg.source.listen_addr, "127.0.0.1:5140");
        assert_eq!(cfg.aggregation.interval, Duration::from_secs(1));
        assert_eq!(cfg.aggregation.session_timeout, Duration::from_secs(30));
        assert_eq!(cfg.aggregation.sub_path_prefix, "/sub");
        assert_eq!(cfg.aggregation.error_status_threshold, 400);
        assert!(cfg.aggregation.session_retention.is_none());
        assert!(cfg.aggregation.max_buckets.is_none());
        assert_eq!(cfg.sinks.writer.batch_size, 200);
        assert_eq!(cfg.sinks.writer.flush_interval, Duration::from_millis(200));
        assert_eq!(cfg.sinks.writer.max_retries, 5);
        assert_eq!(cfg.sinks.clickhouse.table, "stats");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.generator.users, 15);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
source:
  kind: tcp
  listen_addr: "0.0.0.0:6000"
aggregation:
  interval: 2s
  session_timeout: 1m
  session_retention: 10m
  max_buckets: 3600
sinks:
  writer:
    batch_size: 50
    flush_interval: 500ms
  clickhouse:
    enabled: true
    endpoint: "localhost:9000"
    database: clickstream
    migrations:
      enabled: true
  http:
    enabled: true
    address: "http://localhost:8686"
    compression: zstd
    headers:
      Authorization: "Bearer x"
generator:
  users: 3
  duration: 10s
"#;

        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.source.kind, SourceKind::Tcp);
        assert_eq!(cfg.source.listen_addr, "0.0.0.0:6000");
        assert_eq!(cfg.aggregation.interval, Duration::from_secs(2));
        assert_eq!(cfg.aggregation.session_timeout, Duration::from_secs(60));
        assert_eq!(
            cfg.aggregation.session_retention,
            Some(Duration::from_secs(600))
        );
        assert_eq!(cfg.aggregation.max_buckets, Some(3600));
        // Unset fields keep their defaults.
        assert_eq!(cfg.aggregation.sub_path_prefix, "/sub");
        assert_eq!(cfg.sinks.writer.batch_size, 50);
        assert_eq!(cfg.sinks.writer.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.sinks.writer.max_retries, 5);
        assert!(cfg.sinks.clickhouse.migrations.enabled);
        assert_eq!(cfg.sinks.clickhouse.database, "clickstream");
        assert_eq!(cfg.sinks.clickhouse.table, "stats");
        assert_eq!(
            cfg.sinks.http.headers.get("Authorization").map(String::as_str),
            Some("Bearer x")
        );
        assert_eq!(cfg.generator.users, 3);
        assert_eq!(cfg.generator.min_sleep, Duration::from_millis(500));
    }

    #[test]
    fn test_validate_file_source_requires_path() {
        let mut cfg = Config::default();
        cfg.source.kind = SourceKind::File;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("source.path"));

        cfg.source.path = Some(PathBuf::from("/var/log/access.log"));
        cfg.validate().expect("path set");
    }

    #[test]
    fn test_validate_timeout_not_below_interval() {
        let mut cfg = Config::default();
        cfg.aggregation.interval = Duration::from_secs(5);
        cfg.aggregation.session_timeout = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_sub_millisecond_interval() {
        let mut cfg = Config::default();
        cfg.aggregation.interval = Duration::from_micros(500);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_writer() {
        let mut cfg = Config::default();
        cfg.sinks.writer.max_retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.sinks.writer.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_clickhouse_endpoint() {
        let mut cfg = Config::default();
        cfg.sinks.clickhouse.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("clickhouse endpoint"));
    }

    #[test]
    fn test_validate_http_compression() {
        let mut cfg = Config::default();
        cfg.sinks.http.enabled = true;
        cfg.sinks.http.address = "http://localhost:8686".to_string();
        cfg.sinks.http.compression = "brotli".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid compression type"));
    }

    #[test]
    fn test_validate_generator_sleep_bounds() {
        let mut cfg = Config::default();
        cfg.generator.min_sleep = Duration::from_secs(10);
        cfg.generator.max_sleep = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_source_kind_rejected() {
        let yaml = "source:\n  kind: kafka\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}

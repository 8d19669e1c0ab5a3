use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "clickstream";

/// Prometheus metrics for engine health and observability.
///
/// All metrics use the "clickstream" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Total events accepted from the source.
    pub events_received: Counter,
    /// Malformed lines by error_type.
    pub event_parse_errors: CounterVec,
    /// Events outside a counter's pending bucket, by metric.
    pub late_events: CounterVec,
    /// Events too old to refresh their session.
    pub stale_session_events: Counter,

    // === Aggregation ===
    /// Timer emissions by metric.
    pub emissions: CounterVec,
    /// Active session count from the latest emission.
    pub active_sessions: Gauge,
    /// Session entries held in memory, live or expired.
    pub sessions_tracked: Gauge,
    /// Session entries purged by compaction.
    pub sessions_evicted: Counter,
    /// Buckets currently held by the merger.
    pub merger_buckets: Gauge,
    /// Buckets dropped by the merger retention limit.
    pub merger_buckets_evicted: Counter,
    /// Emissions refused because their bucket was already evicted.
    pub merger_late_emissions: Counter,
    /// Timer scheduling failures by metric.
    pub timer_failures: CounterVec,

    // === Sink ===
    /// Row snapshots handed to the sink.
    pub rows_forwarded: Counter,
    /// Current number of rows queued ahead of the writer.
    pub sink_queue_length: Gauge,
    /// Exporter connection state per sink (1=connected, 0=disconnected).
    pub sink_connected: GaugeVec,
    /// Export batch errors by sink and error_type.
    pub export_batch_errors: CounterVec,
    /// Export retries by sink.
    pub export_retries: CounterVec,
    /// Sink flush duration (1ms-1s buckets).
    pub sink_flush_duration: HistogramVec,
    /// Sink batch size (1-1000 buckets).
    pub sink_batch_size: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received from the source.",
            )
            .namespace(NAMESPACE),
        )?;
        let event_parse_errors = CounterVec::new(
            Opts::new(
                "event_parse_errors_total",
                "Total malformed log lines by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let late_events = CounterVec::new(
            Opts::new(
                "late_events_total",
                "Events outside the pending bucket of a counter, by metric.",
            )
            .namespace(NAMESPACE),
            &["metric"],
        )?;
        let stale_session_events = Counter::with_opts(
            Opts::new(
                "stale_session_events_total",
                "Events older than the session timeout.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Aggregation ===
        let emissions = CounterVec::new(
            Opts::new("emissions_total", "Timer emissions by metric.").namespace(NAMESPACE),
            &["metric"],
        )?;
        let active_sessions = Gauge::with_opts(
            Opts::new(
                "active_sessions",
                "Active session count from the latest emission.",
            )
            .namespace(NAMESPACE),
        )?;
        let sessions_tracked = Gauge::with_opts(
            Opts::new(
                "sessions_tracked",
                "Session entries held in memory, live or expired.",
            )
            .namespace(NAMESPACE),
        )?;
        let sessions_evicted = Counter::with_opts(
            Opts::new(
                "sessions_evicted_total",
                "Session entries purged by compaction.",
            )
            .namespace(NAMESPACE),
        )?;
        let merger_buckets = Gauge::with_opts(
            Opts::new("merger_buckets", "Buckets currently held by the merger.")
                .namespace(NAMESPACE),
        )?;
        let merger_buckets_evicted = Counter::with_opts(
            Opts::new(
                "merger_buckets_evicted_total",
                "Buckets dropped by the merger retention limit.",
            )
            .namespace(NAMESPACE),
        )?;
        let merger_late_emissions = Counter::with_opts(
            Opts::new(
                "merger_late_emissions_total",
                "Emissions refused because their bucket was already evicted.",
            )
            .namespace(NAMESPACE),
        )?;
        let timer_failures = CounterVec::new(
            Opts::new(
                "timer_failures_total",
                "Pipelines torn down because their timer could not be armed.",
            )
            .namespace(NAMESPACE),
            &["metric"],
        )?;

        // === Sink ===
        let rows_forwarded = Counter::with_opts(
            Opts::new("rows_forwarded_total", "Row snapshots handed to the sink.")
                .namespace(NAMESPACE),
        )?;
        let sink_queue_length = Gauge::with_opts(
            Opts::new(
                "sink_queue_length",
                "Current number of rows queued ahead of the writer.",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_connected = GaugeVec::new(
            Opts::new(
                "sink_connected",
                "Whether the exporter connection is established (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;
        let export_batch_errors = CounterVec::new(
            Opts::new(
                "export_batch_errors_total",
                "Total export batch errors by sink and error type.",
            )
            .namespace(NAMESPACE),
            &["sink", "error_type"],
        )?;
        let export_retries = CounterVec::new(
            Opts::new("export_retries_total", "Total export retries by sink.")
                .namespace(NAMESPACE),
            &["sink"],
        )?;
        let sink_flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "sink_flush_duration_seconds",
                "Time to flush a batch of rows by sink.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["sink"],
        )?;
        let sink_batch_size = HistogramVec::new(
            HistogramOpts::new("sink_batch_size", "Number of rows per batch flush by sink.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 200.0, 500.0, 1000.0]),
            &["sink"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(event_parse_errors.clone()))?;
        registry.register(Box::new(late_events.clone()))?;
        registry.register(Box::new(stale_session_events.clone()))?;

        registry.register(Box::new(emissions.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(sessions_tracked.clone()))?;
        registry.register(Box::new(sessions_evicted.clone()))?;
        registry.register(Box::new(merger_buckets.clone()))?;
        registry.register(Box::new(merger_buckets_evicted.clone()))?;
        registry.register(Box::new(merger_late_emissions.clone()))?;
        registry.register(Box::new(timer_failures.clone()))?;

        registry.register(Box::new(rows_forwarded.clone()))?;
        registry.register(Box::new(sink_queue_length.clone()))?;
        registry.register(Box::new(sink_connected.clone()))?;
        registry.register(Box::new(export_batch_errors.clone()))?;
        registry.register(Box::new(export_retries.clone()))?;
        registry.register(Box::new(sink_flush_duration.clone()))?;
        registry.register(Box::new(sink_batch_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            event_parse_errors,
            late_events,
            stale_session_events,
            emissions,
            active_sessions,
            sessions_tracked,
            sessions_evicted,
            merger_buckets,
            merger_buckets_evicted,
            merger_late_emissions,
            timer_failures,
            rows_forwarded,
            sink_queue_length,
            sink_connected,
            export_batch_errors,
            export_retries,
            sink_flush_duration,
            sink_batch_size,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

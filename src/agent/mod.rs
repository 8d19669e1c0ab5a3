use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{SystemClock, WallClock};
use crate::config::Config;
use crate::event::stats::IngestStats;
use crate::export::health::HealthMetrics;
use crate::export::{dsn, ClickHouseConnection};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::pipeline::metric::MetricKind;
use crate::pipeline::Engine;
use crate::sink::clickhouse::ClickHouseExporter;
use crate::sink::http::HttpExporter;
use crate::sink::memory::MemoryExporter;
use crate::sink::{spawn_writer, Exporter};
use crate::source::LineSource;

/// Interval between ingest stats log lines.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Agent orchestrates all components: health server, exporters, row writer,
/// aggregation engine and the line source.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    stats: Arc<IngestStats>,
    clock: Arc<dyn WallClock>,
    engine: Option<Engine>,
    engine_stopped: CancellationToken,
    writer: Option<JoinHandle<()>>,
    source: Option<JoinHandle<Result<u64>>>,
    ch_conn: Option<ClickHouseConnection>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            stats: Arc::new(IngestStats::new()),
            clock: Arc::new(SystemClock),
            engine: None,
            engine_stopped: CancellationToken::new(),
            writer: None,
            source: None,
            ch_conn: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before migrations so probes respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Run migrations if enabled.
        let ch_cfg = &self.cfg.sinks.clickhouse;
        if ch_cfg.enabled && ch_cfg.migrations.enabled {
            self.run_migrations().await?;
        }

        // 2. Build and start exporters, then the row writer.
        let exporters = self.build_exporters().await?;
        let names: Vec<&str> = exporters.iter().map(Exporter::name).collect();
        info!(exporters = ?names, "exporters started");

        let (sink, writer) = spawn_writer(
            self.cfg.sinks.writer.clone(),
            exporters,
            Some(Arc::clone(&self.health)),
        );
        self.writer = Some(writer);

        // 3. Start the aggregation engine.
        let engine = Engine::start(
            &self.cfg.aggregation,
            Arc::clone(&self.clock),
            sink,
            Arc::clone(&self.stats),
            Some(Arc::clone(&self.health)),
            CancellationToken::new(),
        )
        .context("starting aggregation engine")?;
        self.engine_stopped = engine.cancel_token();

        // 4. Start the line source.
        let source = LineSource::from_config(&self.cfg.source)?;
        info!(source = source.name(), "starting line source");

        let input = engine.input();
        let cancel = self.cancel.child_token();
        self.source = Some(tokio::spawn(async move {
            let name = source.name();
            match source.run(input, cancel).await {
                Ok(lines) => {
                    info!(source = name, lines, "line source exhausted");
                    Ok(lines)
                }
                Err(e) => {
                    error!(
                        source = name,
                        error = %format_args!("{e:#}"),
                        "line source failed, no further events will be ingested"
                    );
                    Err(e)
                }
            }
        }));
        self.engine = Some(engine);

        // 5. Start background reporters.
        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Token cancelled when the engine stops on its own after a fatal
    /// pipeline failure.
    pub fn engine_stopped(&self) -> CancellationToken {
        self.engine_stopped.clone()
    }

    /// Gracefully stop all components.
    ///
    /// Returns the engine failure, if the engine stopped because of one.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop the source and background tasks first so nothing new arrives.
        self.cancel.cancel();

        if let Some(source) = self.source.take() {
            match source.await {
                Ok(Ok(lines)) => debug!(lines, "line source stopped"),
                Ok(Err(e)) => debug!(error = %format_args!("{e:#}"), "line source had failed"),
                Err(e) => error!(error = %e, "line source task panicked"),
            }
        }

        // Cancel timers and let the merger drain into the writer.
        let engine_result = match self.engine.take() {
            Some(engine) => engine.shutdown().await,
            None => Ok(()),
        };

        // Wait for the writer's final flush and exporter shutdown.
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                error!(error = %e, "row writer task panicked");
            }
        }

        if let Some(conn) = &mut self.ch_conn {
            conn.close();
        }

        // Stop health metrics server.
        self.health.stop().await?;

        report(&self.stats);

        engine_result
    }

    /// Run ClickHouse migrations.
    async fn run_migrations(&self) -> Result<()> {
        info!("running ClickHouse migrations...");

        let ch_cfg = &self.cfg.sinks.clickhouse;
        let pool = clickhouse_rs::Pool::new(dsn(ch_cfg));
        let migrator = ClickHouseMigrator::new(pool, ch_cfg.table.clone());

        migrator
            .up()
            .await
            .context("applying ClickHouse migrations")?;

        let status = migrator.status().await?;
        info!(version = status.version, "ClickHouse migrations applied");

        Ok(())
    }

    /// Builds every enabled exporter. Falls back to a logging in-memory
    /// table when no external sink is configured.
    async fn build_exporters(&mut self) -> Result<Vec<Exporter>> {
        let mut exporters = Vec::new();

        if self.cfg.sinks.clickhouse.enabled {
            let mut conn = ClickHouseConnection::new(self.cfg.sinks.clickhouse.clone());
            let pool = conn
                .connect()
                .await
                .context("connecting to ClickHouse")?
                .clone();

            exporters.push(Exporter::ClickHouse(ClickHouseExporter::new(
                pool,
                conn.qualified_table(),
                Some(Arc::clone(&self.health)),
            )));
            self.ch_conn = Some(conn);

            info!(
                endpoint = %self.cfg.sinks.clickhouse.endpoint,
                "ClickHouse exporter configured",
            );
        }

        if self.cfg.sinks.http.enabled {
            exporters.push(Exporter::Http(HttpExporter::new(
                self.cfg.sinks.http.clone(),
            )));

            info!(
                address = %self.cfg.sinks.http.address,
                "HTTP exporter configured",
            );
        }

        if exporters.is_empty() {
            warn!("no external sink enabled, rows are only logged");
            exporters.push(Exporter::Memory(MemoryExporter::new().with_logging()));
        }

        for exporter in &mut exporters {
            let name = exporter.name();
            exporter
                .start()
                .await
                .with_context(|| format!("starting {name} exporter"))?;
        }

        Ok(exporters)
    }

    /// Spawn background ingest stats reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => report(&stats),
                }
            }
        });
    }
}

/// Logs and resets the ingest counters.
fn report(stats: &IngestStats) {
    let snapshot = stats.snapshot();
    if snapshot.is_empty() {
        return;
    }

    info!(
        received = snapshot.received,
        parse_errors = snapshot.parse_errors,
        stale_sessions = snapshot.stale_sessions,
        late = snapshot.late_total(),
        "ingest stats",
    );

    for kind in MetricKind::ALL {
        let late = snapshot.late.get(kind.index()).copied().unwrap_or(0);
        if late > 0 {
            debug!(metric = %kind, late, "late events");
        }
    }
}

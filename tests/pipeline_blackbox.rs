use std::sync::Arc;
use std::time::Duration;

use clickstream::clock::TokioClock;
use clickstream::config::{AggregationConfig, WriterConfig};
use clickstream::event::stats::IngestStats;
use clickstream::event::Event;
use clickstream::export::health::HealthMetrics;
use clickstream::pipeline::counter::TumblingCounter;
use clickstream::pipeline::merger::MetricMerger;
use clickstream::pipeline::metric::{Emission, MetricKind, MetricRow};
use clickstream::pipeline::Engine;
use clickstream::sink::memory::MemoryExporter;
use clickstream::sink::{spawn_writer, Exporter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn event(session_id: &str, path: &str, code: u16, event_time: i64) -> Event {
    Event {
        source_address: "192.168.0.7".to_string(),
        event_time,
        method: "GET".to_string(),
        path: path.to_string(),
        response_code: code,
        response_time_ms: 1_250,
        session_id: session_id.to_string(),
    }
}

struct Harness {
    engine: Engine,
    memory: MemoryExporter,
    writer: JoinHandle<()>,
}

impl Harness {
    /// Engine on a paused tokio clock anchored at epoch 0.
    fn start(cfg: AggregationConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let memory = MemoryExporter::new();
        let (sink, writer) = spawn_writer(
            WriterConfig::default(),
            vec![Exporter::Memory(memory.clone())],
            health.clone(),
        );
        let engine = Engine::start(
            &cfg,
            Arc::new(TokioClock::new(0)),
            sink,
            Arc::new(IngestStats::new()),
            health,
            CancellationToken::new(),
        )
        .expect("engine starts");

        Self {
            engine,
            memory,
            writer,
        }
    }

    /// Advances paused time to `at` ms since the anchor.
    async fn advance_to(&self, start: tokio::time::Instant, at: u64) {
        tokio::time::sleep_until(start + Duration::from_millis(at)).await;
    }

    async fn finish(self) -> MemoryExporter {
        self.engine.shutdown().await.expect("clean shutdown");
        self.writer.await.expect("writer task");
        self.memory
    }
}

#[tokio::test(start_paused = true)]
async fn sessions_expire_after_timeout_without_further_events() {
    let start = tokio::time::Instant::now();
    let harness = Harness::start(AggregationConfig::default(), None);

    for id in ["A", "B", "C"] {
        harness
            .engine
            .ingest(event(id, "/main/page", 200, 0))
            .await
            .expect("ingest");
    }

    harness.advance_to(start, 31_500).await;
    let memory = harness.finish().await;

    let active = |bucket| memory.row(bucket).map(|row| row.active_session);
    assert_eq!(active(1_000), Some(3));
    // Liveness is inclusive at exactly the timeout.
    assert_eq!(active(30_000), Some(3));
    assert_eq!(active(31_000), Some(0));
}

#[tokio::test(start_paused = true)]
async fn sub_page_counter_counts_bucket_then_resets() {
    let start = tokio::time::Instant::now();
    let harness = Harness::start(AggregationConfig::default(), None);

    for at in [100, 400, 900] {
        harness.advance_to(start, at).await;
        harness
            .engine
            .ingest(event("A", "/sub/x", 200, at as i64))
            .await
            .expect("ingest");
    }

    harness.advance_to(start, 2_500).await;
    let memory = harness.finish().await;

    let first = memory.row(1_000).expect("first bucket");
    assert_eq!(first.sub_per_second, 3);
    assert_eq!(first.request_per_second, 3);
    assert_eq!(first.error_per_second, 0);
    assert_eq!(first.active_session, 1);

    let second = memory.row(2_000).expect("second bucket");
    assert_eq!(second.sub_per_second, 0);
    assert_eq!(second.request_per_second, 0);
}

#[tokio::test(start_paused = true)]
async fn late_events_are_counted_not_aggregated() {
    let start = tokio::time::Instant::now();
    let harness = Harness::start(AggregationConfig::default(), None);

    harness.advance_to(start, 1_200).await;
    // Precedes the pending (1000, 2000] bucket.
    harness
        .engine
        .ingest(event("A", "/sub/x", 500, 800))
        .await
        .expect("ingest late");
    harness
        .engine
        .ingest(event("B", "/sub/x", 500, 1_300))
        .await
        .expect("ingest on time");

    let stats = Arc::clone(harness.engine.stats());
    harness.advance_to(start, 2_100).await;
    let memory = harness.finish().await;

    let row = memory.row(2_000).expect("bucket");
    assert_eq!(row.request_per_second, 1);
    assert_eq!(row.sub_per_second, 1);
    assert_eq!(row.error_per_second, 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.late[MetricKind::RequestPerSecond.index()], 1);
    assert_eq!(snapshot.late[MetricKind::SubPerSecond.index()], 1);
    assert_eq!(snapshot.late[MetricKind::ErrorPerSecond.index()], 1);
    assert_eq!(snapshot.late[MetricKind::ActiveSession.index()], 0);
}

#[tokio::test(start_paused = true)]
async fn compaction_evicts_expired_sessions() {
    let start = tokio::time::Instant::now();
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));
    let cfg = AggregationConfig {
        session_retention: Some(Duration::from_secs(30)),
        compaction_interval: Duration::from_secs(10),
        ..AggregationConfig::default()
    };
    let harness = Harness::start(cfg, Some(Arc::clone(&health)));

    for id in ["A", "B", "C"] {
        harness
            .engine
            .ingest(event(id, "/", 200, 0))
            .await
            .expect("ingest");
    }
    harness.advance_to(start, 15_000).await;
    harness
        .engine
        .ingest(event("D", "/", 200, 15_000))
        .await
        .expect("ingest");

    harness.advance_to(start, 40_500).await;
    let memory = harness.finish().await;

    // A, B and C expired after 30s and were purged at the 40s compaction.
    assert_eq!(health.sessions_evicted.get(), 3.0);
    assert_eq!(health.sessions_tracked.get(), 1.0);
    assert_eq!(memory.row(30_000).map(|r| r.active_session), Some(4));
    assert_eq!(memory.row(31_000).map(|r| r.active_session), Some(1));
    assert_eq!(memory.row(40_000).map(|r| r.active_session), Some(1));
}

#[test]
fn merger_reflects_all_metrics_regardless_of_order() {
    let emissions = [
        (MetricKind::ActiveSession, 2),
        (MetricKind::SubPerSecond, 1),
        (MetricKind::RequestPerSecond, 10),
        (MetricKind::ErrorPerSecond, 0),
    ];
    let expected = MetricRow {
        bucket: 5_000,
        active_session: 2,
        sub_per_second: 1,
        request_per_second: 10,
        error_per_second: 0,
    };

    // Every rotation and its reverse.
    for shift in 0..emissions.len() {
        for reversed in [false, true] {
            let mut order = emissions.to_vec();
            order.rotate_left(shift);
            if reversed {
                order.reverse();
            }

            let mut merger = MetricMerger::new(None);
            let mut last = None;
            for (kind, value) in order {
                last = merger.ingest(Emission {
                    bucket: 5_000,
                    kind,
                    value,
                });
            }

            assert_eq!(last, Some(expected), "shift={shift} reversed={reversed}");
        }
    }
}

#[test]
fn merger_keeps_maximum_value() {
    let mut merger = MetricMerger::new(None);
    for value in [5, 3] {
        merger.ingest(Emission {
            bucket: 7_000,
            kind: MetricKind::RequestPerSecond,
            value,
        });
    }

    assert_eq!(
        merger.row(7_000).map(|row| row.request_per_second),
        Some(5)
    );
}

#[tokio::test]
async fn bounded_merger_never_shrinks_a_stored_row() {
    let memory = MemoryExporter::new();
    let mut merger = MetricMerger::new(Some(1));
    let emissions = [
        (1_000, MetricKind::ActiveSession, 3),
        (2_000, MetricKind::ActiveSession, 3),
        (1_000, MetricKind::RequestPerSecond, 10),
    ];

    for (bucket, kind, value) in emissions {
        if let Some(row) = merger.ingest(Emission {
            bucket,
            kind,
            value,
        }) {
            memory.upsert_rows(&[row]).await.expect("upsert");
        }
    }

    let stored = memory.row(1_000).expect("bucket 1000 stored");
    assert_eq!(stored.active_session, 3);
    assert_eq!(stored.request_per_second, 0);
    assert_eq!(merger.late(), 1);
}

#[test]
fn counter_is_order_independent_within_bucket() {
    let times = [10, 999, 500, 1_000, 1, 250];
    let count_for = |times: &[i64]| {
        let mut counter = TumblingCounter::requests(1_000).expect("counter");
        for t in times {
            counter.ingest(&event("A", "/", 200, *t), 0).expect("ingest");
        }
        counter.on_timer(1_000).expect("fire").value
    };

    let mut reversed = times;
    reversed.reverse();
    let mut sorted = times;
    sorted.sort_unstable();

    assert_eq!(count_for(&times), 6);
    assert_eq!(count_for(&reversed), 6);
    assert_eq!(count_for(&sorted), 6);
}

#[tokio::test]
async fn repeated_upsert_is_idempotent() {
    let memory = MemoryExporter::new();
    let row = MetricRow {
        bucket: 9_000,
        active_session: 4,
        sub_per_second: 1,
        request_per_second: 12,
        error_per_second: 2,
    };

    let exporter = Exporter::Memory(memory.clone());
    exporter.upsert_rows(&[row]).await.expect("first upsert");
    let once = memory.rows();
    exporter.upsert_rows(&[row]).await.expect("second upsert");

    assert_eq!(memory.rows(), once);
    assert_eq!(once, vec![row]);
}

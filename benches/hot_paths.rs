use criterion::{black_box, criterion_group, criterion_main, Criterion};
use clickstream::event::parse::parse_line;
use clickstream::event::Event;
use clickstream::pipeline::counter::TumblingCounter;
use clickstream::pipeline::merger::MetricMerger;
use clickstream::pipeline::metric::{Emission, MetricKind};
use clickstream::pipeline::session::{SessionRegistry, SessionRetention};

const INTERVAL_MS: i64 = 1_000;
const LINE: &str = "192.168.0.41 2024-05-01T10:00:00.250Z POST /sub/page 404 1450 \
                    6f1c2a44-9a3e-4d0f-b7f4-0c1e2d3f4a5b";

fn events(sessions: usize) -> Vec<Event> {
    (0..sessions)
        .map(|i| Event {
            source_address: format!("192.168.0.{}", i % 256),
            event_time: 500,
            method: "GET".to_string(),
            path: if i % 10 == 0 { "/sub/page" } else { "/main/page" }.to_string(),
            response_code: if i % 33 == 0 { 404 } else { 200 },
            response_time_ms: 1_000 + (i as u64 % 900),
            session_id: format!("session-{i}"),
        })
        .collect()
}

fn bench_parse_line(c: &mut Criterion) {
    c.bench_function("parse_line/access_record", |b| {
        b.iter(|| parse_line(black_box(LINE)).expect("parse line"))
    });
}

fn bench_counter(c: &mut Criterion) {
    let events = events(1_024);
    let mut counter = TumblingCounter::sub_pages("/sub", INTERVAL_MS).expect("counter");

    c.bench_function("counter/ingest_1k_mixed", |b| {
        b.iter(|| {
            for e in &events {
                black_box(counter.ingest(e, 500).expect("ingest"));
            }
        })
    });
}

fn bench_sessions(c: &mut Criterion) {
    let events = events(4_096);
    let mut registry =
        SessionRegistry::new(INTERVAL_MS, 30_000, SessionRetention::KeepAll).expect("registry");
    for e in &events {
        registry.ingest(e, 500).expect("seed");
    }

    c.bench_function("sessions/refresh_4k", |b| {
        b.iter(|| {
            for e in &events {
                black_box(registry.ingest(e, 600).expect("refresh"));
            }
        })
    });

    c.bench_function("sessions/count_active_4k", |b| {
        b.iter(|| black_box(registry.active(black_box(1_000))))
    });
}

fn bench_merger(c: &mut Criterion) {
    c.bench_function("merger/ingest_rolling_buckets", |b| {
        let mut merger = MetricMerger::new(Some(3_600));
        let mut bucket = 0i64;
        b.iter(|| {
            bucket += INTERVAL_MS;
            for kind in MetricKind::ALL {
                black_box(merger.ingest(Emission {
                    bucket,
                    kind,
                    value: 42,
                }));
            }
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_counter(c);
    bench_sessions(c);
    bench_merger(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);

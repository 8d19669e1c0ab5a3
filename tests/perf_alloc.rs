use std::alloc::System;
use std::hint::black_box;

use clickstream::event::parse::parse_line;
use clickstream::event::Event;
use clickstream::pipeline::counter::TumblingCounter;
use clickstream::pipeline::merger::MetricMerger;
use clickstream::pipeline::metric::{Emission, MetricKind};
use clickstream::pipeline::session::{SessionRegistry, SessionRetention};
use clickstream::pipeline::IngestOutcome;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const INTERVAL_MS: i64 = 1_000;
const LINE: &str = "192.168.0.41 2024-05-01T10:00:00.250Z GET /sub/page 200 1450 \
                    6f1c2a44-9a3e-4d0f-b7f4-0c1e2d3f4a5b";

fn event(session_id: &str, path: &str, code: u16, event_time: i64) -> Event {
    Event {
        source_address: "192.168.0.41".to_string(),
        event_time,
        method: "GET".to_string(),
        path: path.to_string(),
        response_code: code,
        response_time_ms: 1_450,
        session_id: session_id.to_string(),
    }
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

#[test]
#[serial]
fn parse_line_allocation_budget() {
    let (_parsed, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..512 {
            black_box(parse_line(black_box(LINE)).expect("parse line"));
        }
    });

    // Four owned string fields per event.
    assert!(
        allocations <= 4 * 512 + 8,
        "parse allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn counter_ingest_allocates_nothing() {
    let mut counter = TumblingCounter::sub_pages("/sub", INTERVAL_MS).expect("counter");
    let hit = event("a", "/sub/page", 200, 500);
    let miss = event("a", "/main/page", 200, 500);
    let late = event("a", "/sub/page", 200, -5_000);

    // Arm the timer outside the measured region.
    counter.ingest(&hit, 500).expect("arm");

    let (_out, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..4_096 {
            black_box(counter.ingest(&hit, 500).expect("ingest hit"));
            black_box(counter.ingest(&miss, 500).expect("ingest miss"));
            black_box(counter.ingest(&late, 500).expect("ingest late"));
        }
    });

    assert_eq!(counter.count(), 4_097);
    assert!(
        allocations <= 2,
        "counter ingest allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 2,
        "counter ingest deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn session_refresh_allocates_nothing() {
    let mut registry =
        SessionRegistry::new(INTERVAL_MS, 30_000, SessionRetention::KeepAll).expect("registry");
    let events: Vec<Event> = (0..64)
        .map(|i| event(&format!("session-{i}"), "/main/page", 200, 100))
        .collect();

    for e in &events {
        registry.ingest(e, 100).expect("seed");
    }

    let (_out, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..64 {
            for e in &events {
                let outcome = registry.ingest(e, 200).expect("refresh");
                black_box(outcome == IngestOutcome::Accepted);
            }
        }
    });

    assert_eq!(registry.tracked(), 64);
    assert!(
        allocations <= 2,
        "session refresh allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn session_timer_allocates_nothing() {
    let mut registry =
        SessionRegistry::new(INTERVAL_MS, 30_000, SessionRetention::KeepAll).expect("registry");
    for i in 0..256 {
        registry
            .ingest(&event(&format!("s{i}"), "/", 200, 100), 100)
            .expect("seed");
    }

    let (emissions, allocations, _deallocations) = measure_alloc_counts(|| {
        let mut total = 0;
        let mut fire_at = 1_000;
        for _ in 0..16 {
            let emission = registry.on_timer(fire_at, fire_at).expect("fire");
            total += emission.value;
            fire_at += INTERVAL_MS;
        }
        total
    });

    assert_eq!(emissions, 256 * 16);
    assert!(
        allocations <= 2,
        "session timer allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn merger_same_bucket_allocates_nothing() {
    let mut merger = MetricMerger::new(None);
    merger.ingest(Emission {
        bucket: 1_000,
        kind: MetricKind::ActiveSession,
        value: 1,
    });

    let (_out, allocations, _deallocations) = measure_alloc_counts(|| {
        for i in 0..4_096u64 {
            for kind in MetricKind::ALL {
                black_box(merger.ingest(Emission {
                    bucket: 1_000,
                    kind,
                    value: i,
                }));
            }
        }
    });

    assert_eq!(merger.len(), 1);
    assert!(
        allocations <= 2,
        "merger allocation budget exceeded: {}",
        allocations
    );
}

//! Fusion throughput benchmark.
//!
//! Measures ingest (rate limit + debounce + buffer) and correlation pass
//! cost over growing batches using Criterion.

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use orchestration_core::fusion::{EventFusionBus, FusionRule, RawEvent};
use orchestration_core::types::{FusionConfig, GeoPoint, Priority};

const EVENT_TYPES: &[&str] = &["gunshot_detected", "officer_distress", "crowd_density", "lpr_hit"];

fn batch(size: usize) -> Vec<RawEvent> {
    let base = Utc::now();
    (0..size)
        .map(|i| {
            RawEvent::new(format!("sensor-{}", i % 16), EVENT_TYPES[i % EVENT_TYPES.len()])
                .with_priority(if i % 3 == 0 { Priority::High } else { Priority::Medium })
                .with_entity(format!("entity-{}", i))
                .with_geolocation(GeoPoint::new(40.0 + (i % 10) as f64 * 0.001, -74.0))
                .with_timestamp(base + Duration::milliseconds(i as i64 * 10))
        })
        .collect()
}

fn bus(rt: &tokio::runtime::Runtime) -> EventFusionBus {
    let bus = EventFusionBus::new(FusionConfig {
        rate_limit_per_second: 1_000_000,
        buffer_capacity: 100_000,
        ..FusionConfig::default()
    });
    rt.block_on(async {
        for rule in FusionRule::default_catalogue() {
            bus.add_rule(rule).await.unwrap();
        }
    });
    bus
}

fn bench_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sizes: &[usize] = &[100, 1_000];

    let mut group = c.benchmark_group("ingest");
    for &size in sizes {
        let events = batch(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| {
                let bus = bus(&rt);
                rt.block_on(async {
                    for event in events {
                        black_box(bus.ingest(event.clone()).await);
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_fuse(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = bus(&rt);
    let sizes: &[usize] = &[10, 100, 1_000];

    let mut group = c.benchmark_group("fuse");
    for &size in sizes {
        let events = batch(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| rt.block_on(async { bus.fuse(Some(black_box(events.clone()))).await }));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_fuse);
criterion_main!(benches);

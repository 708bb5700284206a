// Criterion benchmarks for hivebus-metrics
//
// Run benchmarks with:
//   cargo bench -p hivebus-metrics

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hivebus_metrics::{BrokerMetricsCollector, DeliveryOutcome, MetricsCollector};
use std::time::Instant;

fn bench_record_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_call");
    let collector = BrokerMetricsCollector::new();

    group.bench_function("single_method", |b| {
        b.iter(|| {
            collector.record_call(black_box("task.get"), black_box(Instant::now()), black_box(true));
        });
    });

    let methods = ["agent.heartbeat", "task.create", "task.get", "task.list", "discovery.query"];
    group.bench_function("five_methods", |b| {
        b.iter(|| {
            for method in &methods {
                collector.record_call(black_box(method), black_box(Instant::now()), true);
            }
        });
    });

    group.finish();
}

fn bench_record_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_delivery");
    let collector = BrokerMetricsCollector::new();
    let destinations: Vec<String> = (0..64).map(|i| format!("svc-{i}")).collect();

    group.bench_function("64_destinations", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let dest = &destinations[i % destinations.len()];
            collector.record_delivery(black_box(dest), DeliveryOutcome::Delivered);
            i += 1;
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let collector = BrokerMetricsCollector::new();
    for i in 0..100 {
        collector.record_call(&format!("method_{}", i % 10), Instant::now(), i % 2 == 0);
        collector.record_delivery(&format!("svc-{}", i % 20), DeliveryOutcome::Delivered);
    }

    c.bench_function("snapshot", |b| b.iter(|| collector.snapshot()));
}

criterion_group!(benches, bench_record_call, bench_record_delivery, bench_snapshot);
criterion_main!(benches);

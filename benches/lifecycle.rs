//! Benchmarks for apiserve components.

use apiserve::metrics::MetricsCollector;
use apiserve::server::{named_check, HealthCheckError, HealthChecks, LifecycleSignals, Signal};
use apiserve::util::generate_request_id;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;

fn benchmark_signal(c: &mut Criterion) {
    let mut group = c.benchmark_group("signal");

    group.bench_function("fire_unfired", |b| {
        b.iter(|| {
            let signal = Signal::new("Bench");
            signal.fire();
            black_box(signal.is_fired());
        })
    });

    let fired = Signal::new("Fired");
    fired.fire();
    group.bench_function("fire_again", |b| {
        b.iter(|| fired.fire())
    });

    let signals = LifecycleSignals::new();
    let shutting_down = signals.shutting_down();
    group.bench_function("is_signaled", |b| {
        b.iter(|| black_box(shutting_down.is_signaled()))
    });

    group.finish();
}

fn benchmark_health_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("health");

    for count in [1usize, 10] {
        let checks = HealthChecks::new("readyz");
        checks
            .add_checks((0..count).map(|i| {
                named_check(format!("check-{i}"), move || {
                    if i % 2 == 0 {
                        Ok(())
                    } else {
                        Err(HealthCheckError::new("down"))
                    }
                })
            }))
            .unwrap();
        let installed = checks.install().unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("evaluate_{count}"), |b| {
            b.iter(|| black_box(installed.evaluate()))
        });
    }

    group.finish();
}

fn benchmark_metrics(c: &mut Criterion) {
    let metrics = MetricsCollector::new();
    let mut group = c.benchmark_group("metrics");

    group.bench_function("record_request", |b| {
        b.iter(|| {
            metrics.record_request("/hello", "GET", 200, Duration::from_micros(150));
        })
    });

    group.bench_function("set_signal", |b| {
        b.iter(|| metrics.set_signal("ShutdownInitiated", true))
    });

    group.bench_function("encode", |b| b.iter(|| black_box(metrics.encode())));

    group.finish();
}

fn benchmark_request_id(c: &mut Criterion) {
    c.bench_function("generate_request_id", |b| {
        b.iter(|| black_box(generate_request_id()))
    });
}

criterion_group!(
    benches,
    benchmark_signal,
    benchmark_health_evaluate,
    benchmark_metrics,
    benchmark_request_id,
);

criterion_main!(benches);

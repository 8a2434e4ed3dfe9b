//! Comparator Benchmarks for tablekeep
//!
//! Every table lookup runs the installed comparator O(log n) times, so these
//! are the hot paths of the engine.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tablekeep::keys::{namespace, schedule, structured, ScheduleKey, StructuredKey};

fn key(parts: Vec<StructuredKey>) -> Vec<u8> {
    StructuredKey::Array(parts).encode().map(|b| b.to_vec()).unwrap_or_default()
}

/// Benchmark structured key comparison
fn bench_structured(c: &mut Criterion) {
    let mut group = c.benchmark_group("structured_compare");
    group.throughput(Throughput::Elements(1));

    let small_a = StructuredKey::Int(42).encode().unwrap();
    let small_b = StructuredKey::Int(-7).encode().unwrap();
    group.bench_function("int", |b| {
        b.iter(|| structured::compare(black_box(&small_a), black_box(&small_b)))
    });

    let str_a = StructuredKey::Str("user:0000001".into()).encode().unwrap();
    let str_b = StructuredKey::Str("user:0000002".into()).encode().unwrap();
    group.bench_function("string", |b| {
        b.iter(|| structured::compare(black_box(&str_a), black_box(&str_b)))
    });

    let tuple_a = key(vec![
        StructuredKey::Int(1_700_000_000),
        StructuredKey::Str("orders".into()),
        StructuredKey::Int(12),
    ]);
    let tuple_b = key(vec![
        StructuredKey::Int(1_700_000_000),
        StructuredKey::Str("orders".into()),
        StructuredKey::Int(13),
    ]);
    group.bench_function("array_common_prefix", |b| {
        b.iter(|| structured::compare(black_box(&tuple_a), black_box(&tuple_b)))
    });

    let nested = key(vec![StructuredKey::Array(vec![StructuredKey::Array(vec![
        StructuredKey::Str("deep".into()),
    ])])]);
    group.bench_function("nested", |b| {
        b.iter(|| structured::compare(black_box(&nested), black_box(&nested)))
    });

    group.finish();
}

/// Benchmark schedule key comparison
fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_compare");
    group.throughput(Throughput::Elements(1));

    let a = ScheduleKey::new(1_700_000_000, 10, 1).encode();
    let b = ScheduleKey::new(1_700_000_000, 11, 1).encode();
    group.bench_function("tie_on_expire_at", |bench| {
        bench.iter(|| schedule::compare(black_box(&a), black_box(&b)))
    });

    let later = ScheduleKey::new(1_700_000_500, 0, 0).encode();
    group.bench_function("differs_on_expire_at", |bench| {
        bench.iter(|| schedule::compare(black_box(&a), black_box(&later)))
    });

    group.finish();
}

/// Benchmark namespace splitting
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    group.throughput(Throughput::Elements(1));

    group.bench_function("tagged", |b| {
        b.iter(|| namespace::split(black_box(b"users:alice")))
    });
    group.bench_function("untagged", |b| {
        b.iter(|| namespace::split(black_box(b"session-0123456789")))
    });

    group.finish();
}

criterion_group!(benches, bench_structured, bench_schedule, bench_split);
criterion_main!(benches);

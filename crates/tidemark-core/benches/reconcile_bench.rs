//! # Reconciliation Benchmarks
//!
//! Throughput of event and snapshot passes over the in-memory store.
//!
//! Run with: `cargo bench -p tidemark-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tidemark_core::{
    AuditProjector, FieldValue, MemoryStore, Pipeline, RawRecord, ReconcileConfig, Sequence,
};

/// `keys` keys, each receiving `per_key` revisions with a changing email.
fn event_batch(keys: usize, per_key: usize) -> Vec<RawRecord> {
    let mut records = Vec::with_capacity(keys * per_key);
    for seq in 0..per_key {
        for key in 0..keys {
            let source = if seq % 2 == 0 { "mssql" } else { "mongodb" };
            records.push(
                RawRecord::new(source)
                    .field("cpf", FieldValue::text(format!("{key:011}")))
                    .field("sequence", FieldValue::Int(seq as i64))
                    .field("email", FieldValue::text(format!("u{key}-{seq}@x.com")))
                    .field("city", FieldValue::text("Recife")),
            );
        }
    }
    records
}

fn snapshot_batch(keys: usize, variant: usize) -> Vec<RawRecord> {
    (0..keys)
        .map(|key| {
            RawRecord::new("mssql")
                .field("cpf", FieldValue::text(format!("{key:011}")))
                .field("email", FieldValue::text(format!("u{key}-{}@x.com", key % variant.max(1))))
        })
        .collect()
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_event_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_pass");

    for keys in [100, 1000, 10000].iter() {
        let records = event_batch(*keys, 4);
        group.bench_with_input(BenchmarkId::from_parameter(keys), &records, |b, records| {
            b.iter(|| {
                let pipeline = Pipeline::new(ReconcileConfig::user_identity(), MemoryStore::new())
                    .expect("pipeline");
                black_box(pipeline.run_events(records).expect("pass"))
            });
        });
    }

    group.finish();
}

fn bench_snapshot_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_diff");

    for keys in [100, 1000, 10000].iter() {
        let first = snapshot_batch(*keys, 1);
        let second = snapshot_batch(keys / 2, 3);
        group.bench_with_input(BenchmarkId::from_parameter(keys), keys, |b, _| {
            b.iter(|| {
                let pipeline = Pipeline::new(ReconcileConfig::user_identity(), MemoryStore::new())
                    .expect("pipeline");
                pipeline
                    .run_snapshot(&first, Sequence::Counter(1))
                    .expect("first");
                black_box(
                    pipeline
                        .run_snapshot(&second, Sequence::Counter(2))
                        .expect("second"),
                )
            });
        });
    }

    group.finish();
}

fn bench_audit(c: &mut Criterion) {
    let config = ReconcileConfig::user_identity();
    let pipeline = Pipeline::new(config.clone(), MemoryStore::new()).expect("pipeline");
    pipeline.run_events(&event_batch(5000, 6)).expect("pass");

    c.bench_function("audit_5000_keys", |b| {
        b.iter(|| {
            black_box(
                AuditProjector::new(&config.audit)
                    .project(pipeline.store())
                    .expect("audit"),
            )
        });
    });
}

criterion_group!(benches, bench_event_pass, bench_snapshot_diff, bench_audit);
criterion_main!(benches);

// benches/authority_bench.rs

//! Benchmarks for the authority arbitration hot path: every scheduler pop
//! and every incoming event evaluates the hash.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use vigil::core::cluster::authority::{FEATURE_CHECKER, authority_for, authority_hash};

fn bench_authority_hash(c: &mut Criterion) {
    c.bench_function("authority_hash", |b| {
        b.iter(|| authority_hash(black_box("web-server-42!disk-usage"), black_box(FEATURE_CHECKER)))
    });
}

fn bench_authority_for(c: &mut Criterion) {
    let members: Vec<String> = (0..5).map(|i| format!("satellite-{i}")).collect();
    let names: Vec<String> = (0..1000).map(|i| format!("host{i}!load")).collect();
    c.bench_function("authority_for_1k_objects", |b| {
        b.iter(|| {
            for name in &names {
                black_box(authority_for(black_box(&members), name, FEATURE_CHECKER));
            }
        })
    });
}

criterion_group!(benches, bench_authority_hash, bench_authority_for);
criterion_main!(benches);

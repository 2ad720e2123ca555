// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keyspace::dash::DashTable;
use keyspace::key::PrimeKey;

fn bench_insert(c: &mut Criterion) {
    c.bench_function("dash_insert_100k", |b| {
        b.iter(|| {
            let mut table: DashTable<u64> = DashTable::new();
            for i in 0..100_000u64 {
                let key = format!("bench-key-{i}");
                table.insert(PrimeKey::new(key.as_bytes()), i);
            }
            black_box(table.len())
        })
    });
}

fn bench_find(c: &mut Criterion) {
    let mut table: DashTable<u64> = DashTable::new();
    for i in 0..100_000u64 {
        let key = format!("bench-key-{i}");
        table.insert(PrimeKey::new(key.as_bytes()), i);
    }

    c.bench_function("dash_find_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("bench-key-{}", i % 100_000);
            i += 1;
            black_box(table.find(key.as_bytes()))
        })
    });

    c.bench_function("dash_find_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing-key-{i}");
            i += 1;
            black_box(table.find(key.as_bytes()))
        })
    });
}

criterion_group!(benches, bench_insert, bench_find);
criterion_main!(benches);

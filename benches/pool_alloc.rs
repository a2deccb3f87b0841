// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MemPool slot allocation benchmarks.
//
// Groups:
//   pool_allocate_release — allocate_slot/release_slot round trip, at a few
//                           slot sizes, compared against the global allocator
//                           doing the equivalent Vec<u8> alloc/drop.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use inc_runtime::MemPool;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_1024", 1024), ("large_8192", 8192)];

fn bench_pool_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_allocate_release");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let pool = MemPool::new_private(sz, 64).expect("private pool");
            b.iter(|| {
                let slot = pool.allocate_slot(sz).expect("slot available");
                black_box(slot.data_ptr);
                pool.release_slot(slot.data_ptr);
            });
        });
    }

    group.finish();
}

fn bench_global_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("global_alloc");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let v: Vec<u8> = vec![0xABu8; sz];
                black_box(v)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool_allocate_release, bench_global_alloc);
criterion_main!(benches);

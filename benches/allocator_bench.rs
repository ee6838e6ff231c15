//! Benchmarks for the ArrayBuffer allocator
//!
//! Measures:
//! - Allocate/free cost with and without tracking
//! - Tracked reallocation

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use openworkers_environment_v8::{ArrayBufferAllocator, ProcessOptions};
use std::hint::black_box;

const SIZES: &[usize] = &[64, 4 * 1024, 256 * 1024];

fn bench_allocate_free(c: &mut Criterion) {
    let options = ProcessOptions::default();
    let mut group = c.benchmark_group("allocate_free");

    for &size in SIZES {
        for tracking in [false, true] {
            let allocator = ArrayBufferAllocator::create(tracking, &options);
            let label = if tracking { "tracking" } else { "plain" };

            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &size| {
                b.iter(|| {
                    let ptr = allocator.allocate(black_box(size));
                    unsafe { allocator.free(ptr, size) };
                });
            });
        }
    }

    group.finish();
}

fn bench_uninitialized(c: &mut Criterion) {
    let allocator = ArrayBufferAllocator::create(false, &ProcessOptions::default());

    c.bench_function("allocate_uninitialized_256k", |b| {
        b.iter(|| {
            let ptr = allocator.allocate_uninitialized(black_box(256 * 1024));
            unsafe { allocator.free(ptr, 256 * 1024) };
        });
    });
}

fn bench_tracked_reallocate(c: &mut Criterion) {
    let allocator = ArrayBufferAllocator::create(true, &ProcessOptions::default());

    c.bench_function("tracked_reallocate_grow", |b| {
        b.iter(|| {
            let ptr = allocator.allocate(1024);
            let ptr = unsafe { allocator.reallocate(ptr, 1024, black_box(64 * 1024)) };
            unsafe { allocator.free(ptr, 64 * 1024) };
        });
    });

    assert_eq!(allocator.outstanding_allocations(), Some(0));
}

criterion_group!(benches, bench_allocate_free, bench_uninitialized, bench_tracked_reallocate);
criterion_main!(benches);

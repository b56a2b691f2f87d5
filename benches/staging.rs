//! Staging ring benchmarks.
//!
//! Run with: cargo bench --bench staging

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpustage::util::size::{kb, mb};
use gpustage::{DummyDevice, MemoryAllocator, RingState, StagingRingBuffer};

fn bench_ring_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_state");

    group.bench_function("allocate_256b_1000x", |b| {
        let mut ring = RingState::new(mb(1));
        b.iter(|| {
            for _ in 0..1000 {
                black_box(ring.allocate(256, 16).unwrap());
            }
        })
    });

    // Odd sizes force padding and frequent wraps.
    group.bench_function("allocate_wrapping_1000x", |b| {
        let mut ring = RingState::new(kb(16));
        b.iter(|| {
            for i in 0..1000u64 {
                black_box(ring.allocate(700 + i % 300, 64).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_staging_write(c: &mut Criterion) {
    let device = Arc::new(DummyDevice::new());
    let mut allocator = MemoryAllocator::new(device, 0.8);
    let mut ring = StagingRingBuffer::new(&mut allocator, mb(4), 0.5).unwrap();

    let mut group = c.benchmark_group("staging_write");

    for size in [64u64, 1024, 16 * 1024, 256 * 1024] {
        let data = vec![0xABu8; size as usize];
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let region = ring.allocate(data.len() as u64, 16).unwrap();
                ring.write(&region, black_box(data)).unwrap();
            })
        });
    }

    group.finish();
    ring.destroy(&mut allocator);
}

criterion_group!(benches, bench_ring_state, bench_staging_write);
criterion_main!(benches);

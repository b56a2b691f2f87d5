//! Transfer path benchmarks against the software device.
//!
//! Run with: cargo bench --bench transfers

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use gpustage::util::size::{kb, mb};
use gpustage::{BufferUsage, DummyDevice, MemoryPropertyFlags, ResourceConfig, ResourceCoordinator, TransferRequest};

fn coordinator() -> ResourceCoordinator {
    let device = Arc::new(DummyDevice::new());
    ResourceCoordinator::new(device, ResourceConfig::default().with_staging_pool_size(mb(8))).unwrap()
}

fn bench_copy_paths(c: &mut Criterion) {
    let mut gpu = coordinator();
    let mut mapped = gpu.create_mapped_buffer(kb(64), BufferUsage::UNIFORM_BUFFER).unwrap();
    let mut local = gpu
        .create_buffer(kb(64), BufferUsage::TRANSFER_DST, MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let data = vec![1u8; kb(4) as usize];

    let mut group = c.benchmark_group("copy_to_buffer");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("direct_4kb", |b| {
        b.iter(|| gpu.copy_to_buffer(&mut mapped, black_box(&data), 0).unwrap())
    });

    group.bench_function("staged_4kb", |b| {
        b.iter(|| gpu.copy_to_buffer(&mut local, black_box(&data), 0).unwrap())
    });

    group.bench_function("staged_async_4kb", |b| {
        b.iter(|| {
            let mut token = gpu.copy_to_buffer_async(&mut local, black_box(&data), 0).unwrap();
            gpu.free_async_transfer(&mut token).unwrap();
        })
    });

    group.finish();
    gpu.destroy_resource(mapped);
    gpu.destroy_resource(local);
}

fn bench_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("batching");

    // 64 small appends uploaded by one copy, versus 64 individual copies.
    group.bench_function("gpu_buffer_64x256b", |b| {
        let mut gpu = coordinator();
        let id = gpu.create_gpu_buffer(kb(16), BufferUsage::VERTEX_BUFFER, true).unwrap();
        let chunk = [2u8; 256];
        b.iter(|| {
            for _ in 0..64 {
                gpu.add_data(id, black_box(&chunk), 16).unwrap();
            }
            gpu.flush_buffer(id, 0).unwrap();
            gpu.end_frame().unwrap();
        })
    });

    group.bench_function("execute_batch_64x256b", |b| {
        let mut gpu = coordinator();
        let mut targets: Vec<_> = (0..64)
            .map(|_| {
                gpu.create_buffer(256, BufferUsage::TRANSFER_DST, MemoryPropertyFlags::DEVICE_LOCAL)
                    .unwrap()
            })
            .collect();
        let chunk = [3u8; 256];
        b.iter(|| {
            let mut batch: Vec<_> = targets
                .iter_mut()
                .map(|dst| TransferRequest::new(dst, &chunk, 0))
                .collect();
            gpu.execute_batch(&mut batch).unwrap();
        });
        for target in targets {
            gpu.destroy_resource(target);
        }
    });

    group.finish();
}

criterion_group!(benches, bench_copy_paths, bench_batching);
criterion_main!(benches);

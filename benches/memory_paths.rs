//! Hot-path benchmarks: pool acquisition, id resolution and batch planning.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use edgeflow::dispatch::{BatchSpec, plan_batches};
use edgeflow::memory::{
    AllocatorRegistry, BufferIdCache, BufferPool, CachePolicy, MemoryDevice, MemoryFlags,
    MemoryTarget, SimDevice,
};
use std::sync::Arc;

fn bench_pool_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release");
    let device: Arc<dyn MemoryDevice> = SimDevice::new();
    let registry = AllocatorRegistry::new();

    for size in [4 * 1024, 256 * 1024] {
        let flags = MemoryFlags::new(MemoryTarget::Dms0, CachePolicy::Default);
        let pool = BufferPool::create(registry.contiguous(&device), 2, 4, flags, &[size], &[]).unwrap();
        pool.set_active(true).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &pool, |b, pool| {
            b.iter(|| {
                let buffer = pool.acquire().expect("pool active");
                std::hint::black_box(buffer.phys_addr());
            });
        });
        pool.set_active(false).unwrap();
    }

    group.finish();
}

fn bench_id_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_cache");
    let device: Arc<dyn MemoryDevice> = SimDevice::new();
    let registry = AllocatorRegistry::new();
    let flags = MemoryFlags::new(MemoryTarget::Ev74, CachePolicy::Default);
    let buffers: Vec<_> = (0..8)
        .map(|_| registry.contiguous(&device).alloc(flags, 4096).unwrap())
        .collect();
    let cache = BufferIdCache::new(device.clone());
    for buffer in &buffers {
        cache.resolve(buffer.phys_addr()).unwrap();
    }

    group.throughput(Throughput::Elements(buffers.len() as u64));
    group.bench_function("resolve_hit", |b| {
        b.iter(|| {
            for buffer in &buffers {
                let resolved = cache.resolve(buffer.phys_addr()).unwrap();
                std::hint::black_box(resolved.as_ptr());
            }
        });
    });
    group.bench_function("resolve_phys_hit", |b| {
        b.iter(|| {
            for buffer in &buffers {
                std::hint::black_box(cache.resolve_phys(buffer.phys_addr()).unwrap());
            }
        });
    });

    group.finish();
    cache.clear();
}

fn bench_plan_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_batches");

    for (batch_size, batch_model) in [(1, 1), (8, 8), (64, 12)] {
        let spec = BatchSpec {
            batch_size,
            batch_model,
            input_base: 0x1000_0000,
            output_base: 0x2000_0000,
            in_tensor_size: 640 * 480 * 3,
            out_tensor_size: 1024,
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{batch_size}x{batch_model}")),
            &spec,
            |b, spec| b.iter(|| std::hint::black_box(plan_batches(spec).unwrap())),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_pool_acquire_release, bench_id_cache, bench_plan_batches);
criterion_main!(benches);

//! Hot-path microbenchmarks: lane push/pop, queue emplace, and the shm
//! allocator.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use quarry_runtime::ids::QueueId;
use quarry_runtime::lane::{lane_flags, lane_stride, LaneRef};
use quarry_runtime::queue::{PriorityInfo, QueueRef};
use quarry_runtime::task::TaskPrio;
use quarry_shm::ShmRegion;

fn lane_push_pop(c: &mut Criterion) {
    let depth = 1024u32;
    let mut mem = vec![0u8; lane_stride(depth) + 64];
    let base = {
        let addr = mem.as_mut_ptr() as usize;
        ((addr + 63) & !63) as *mut u8
    };
    let lane = unsafe { LaneRef::init_at(base, depth, lane_flags::LOW_LATENCY) };

    let mut group = c.benchmark_group("lane");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        b.iter(|| {
            lane.emplace(black_box(0x1000));
            lane.pop()
        });
    });
    group.finish();
}

fn queue_emplace(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let region = ShmRegion::create(dir.path(), "bench_queue", 64 << 20).unwrap();
    let queue = QueueRef::create(
        &region,
        QueueId::new(1, 9),
        &[PriorityInfo::new(
            TaskPrio::LowLatency,
            8,
            8,
            4096,
            lane_flags::LOW_LATENCY,
        )],
    )
    .unwrap();

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("emplace_drain", |b| {
        let mut hash = 0u32;
        b.iter(|| {
            hash = hash.wrapping_add(1);
            queue.emplace(TaskPrio::LowLatency, black_box(hash), 0x40);
            queue.lane(TaskPrio::LowLatency, hash % 8).pop()
        });
    });
    group.finish();
}

fn shm_alloc(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let region = ShmRegion::create(dir.path(), "bench_alloc", 256 << 20).unwrap();

    let mut group = c.benchmark_group("shm");
    group.throughput(Throughput::Elements(1));
    group.bench_function("alloc_free_256", |b| {
        b.iter(|| {
            let ptr = region.alloc(black_box(256), 8).unwrap();
            region.free(ptr, 256);
        });
    });
    group.finish();
}

criterion_group!(benches, lane_push_pop, queue_emplace, shm_alloc);
criterion_main!(benches);

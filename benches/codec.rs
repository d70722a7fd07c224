use criterion::{black_box, criterion_group, criterion_main, Criterion, BenchmarkId, Throughput};
use pose_relay::{
    MemoryPeer, PoseFrame, Quality, QualityFrames, RelayContext, Scheduler, SchedulerConfig,
    Quat, Vec3, MUSCLE_COUNT,
    repack_all,
};
use std::sync::Arc;

fn create_test_pose(seed: usize) -> PoseFrame {
    let mut muscles = [0.0f32; MUSCLE_COUNT];
    for (i, muscle) in muscles.iter_mut().enumerate() {
        *muscle = (((i + seed) % 17) as f32 / 8.5) - 1.0;
    }

    PoseFrame::new(
        Vec3::new(seed as f32 * 0.5, 1.7, -(seed as f32)),
        muscles,
        1.0,
        Quat::new(0.1, 0.7, -0.1, 0.7).sanitized(),
    )
}

fn benchmark_encode(c: &mut Criterion) {
    let pose = create_test_pose(3);

    let mut group = c.benchmark_group("frame_encode");

    for quality in Quality::ALL {
        group.bench_with_input(
            BenchmarkId::new("encode", format!("{:?}", quality)),
            &quality,
            |b, quality| {
                b.iter(|| pose.encode(black_box(*quality)).unwrap());
            },
        );
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let frame = create_test_pose(5).encode(Quality::High).unwrap();

    c.bench_function("frame_decode/High", |b| {
        b.iter(|| PoseFrame::decode(black_box(&frame), Quality::High, Some(0.02)).unwrap());
    });
}

fn benchmark_repack(c: &mut Criterion) {
    let frame = create_test_pose(7).encode(Quality::High).unwrap();

    let mut group = c.benchmark_group("repack");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("repack_all", |b| {
        b.iter(|| repack_all(black_box(&frame)).unwrap());
    });

    group.bench_function("uniform_fallback", |b| {
        b.iter(|| QualityFrames::uniform(black_box(frame.clone()), Quality::High));
    });

    group.finish();
}

fn benchmark_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_tick");

    for participant_count in &[8usize, 32, 128] {
        let scheduler = Scheduler::new(SchedulerConfig::new(), Arc::new(RelayContext::default())).unwrap();
        let peers: Vec<Arc<MemoryPeer>> = (0..*participant_count).map(|_| Arc::new(MemoryPeer::new())).collect();
        let frames: Vec<_> = (0..*participant_count)
            .map(|i| create_test_pose(i).encode(Quality::High).unwrap())
            .collect();

        group.throughput(Throughput::Elements((participant_count * participant_count) as u64));
        group.bench_with_input(
            BenchmarkId::new("full_update", participant_count),
            participant_count,
            |b, _| {
                let mut now = 0u64;
                b.iter(|| {
                    for (i, peer) in peers.iter().enumerate() {
                        scheduler.submit(i as u16, peer, frames[i].clone());
                    }
                    now += 1000;
                    let report = scheduler.tick(now);
                    for peer in &peers {
                        peer.take_sent();
                    }
                    black_box(report)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_repack,
    benchmark_tick,
);

criterion_main!(benches);

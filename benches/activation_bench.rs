use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use vdenc_pipeline::{
    Dimensions, DriverConfig, EncodeFrame, FeatureConfig, FrameSeq, HostMemory, PictureType,
    PipelineController, RateControlMode, RecordingQueue, SequenceParams, TileLayout,
};

const FRAMES: u32 = 64;

fn controller(features: FeatureConfig, vdbox: u8) -> (Arc<RecordingQueue>, PipelineController) {
    let config = DriverConfig {
        vdbox_count: Some(vdbox),
        ..DriverConfig::default()
    }
    .resolve_with(|_| None)
    .expect("driver config should resolve");
    let queue = Arc::new(RecordingQueue::default());
    let controller = PipelineController::builder()
        .config(config)
        .features(features)
        .queue(queue.clone())
        .memory(Arc::new(HostMemory::new()))
        .build()
        .expect("controller should build");
    (queue, controller)
}

/// Plans and submits `FRAMES` frames, retiring the recorded work whenever the
/// ring fills up.
fn run_activations(features: &FeatureConfig, vdbox: u8, frames: &[EncodeFrame]) {
    let (queue, mut ctl) = controller(features.clone(), vdbox);
    for frame in frames {
        if ctl.activate_frame(frame).is_err() {
            queue.retire_all();
            ctl.poll_completions().expect("poll should succeed");
            ctl.activate_frame(frame).expect("retry should succeed");
        }
    }
    queue.retire_all();
    ctl.poll_completions().expect("poll should succeed");
}

fn activation_benchmark(c: &mut Criterion) {
    let sequence = SequenceParams::for_dims(
        Dimensions::new(1920, 1080).expect("1080p is a valid size"),
    );

    let mut group = c.benchmark_group("activate_frame");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));
    group.throughput(Throughput::Elements(u64::from(FRAMES)));

    for (label, mode, passes) in [
        ("cqp", RateControlMode::Cqp, 1),
        ("cbr", RateControlMode::Cbr, 2),
        ("vbr", RateControlMode::Vbr, 4),
    ] {
        for (columns, vdbox) in [(1u32, 1u8), (2, 2), (4, 4)] {
            let mut features = FeatureConfig {
                rate_control_mode: mode,
                max_brc_passes: passes,
                ..FeatureConfig::default()
            };
            let mut frames: Vec<_> = (0..FRAMES)
                .map(|i| {
                    let picture_type = if i == 0 { PictureType::I } else { PictureType::P };
                    EncodeFrame::new(FrameSeq(i), picture_type, sequence.clone())
                })
                .collect();
            if columns > 1 {
                let layout = TileLayout::uniform(&sequence, columns, 1);
                let slices = layout.slices().expect("tile layout should fit");
                frames = frames
                    .into_iter()
                    .map(|f| f.with_slices(slices.clone()))
                    .collect();
                features.tiling_enabled = true;
                features.tile_layout = Some(layout);
            }
            group.bench_with_input(
                BenchmarkId::new(label, format!("pipes_{vdbox}/cols_{columns}")),
                &frames,
                |b, frames| {
                    b.iter(|| run_activations(&features, vdbox, frames));
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, activation_benchmark);
criterion_main!(benches);

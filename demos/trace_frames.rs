use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use vdenc_pipeline::{
    Dimensions, DriverConfig, EncodeFrame, EncodeSession, FeatureConfig, FirmwareStatus, FrameSeq,
    HostMemory, PictureType, Platform, PlatformSettings, RateControlMode, SequenceParams,
    SimEngine, SimOptions, TileLayout,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Cqp,
    Cbr,
    Vbr,
    Icq,
    Qvbr,
}

impl From<Mode> for RateControlMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Cqp => Self::Cqp,
            Mode::Cbr => Self::Cbr,
            Mode::Vbr => Self::Vbr,
            Mode::Icq => Self::Icq,
            Mode::Qvbr => Self::Qvbr,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Gen {
    Gen11,
    Gen12,
    Xe2,
}

impl From<Gen> for Platform {
    fn from(generation: Gen) -> Self {
        match generation {
            Gen::Gen11 => Self::Gen11,
            Gen::Gen12 => Self::Gen12,
            Gen::Xe2 => Self::Xe2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Drive the encode pipeline against the simulated engine and print status reports")]
struct Args {
    #[arg(long, value_enum, default_value = "vbr")]
    mode: Mode,
    #[arg(long, value_enum, default_value = "gen12")]
    platform: Gen,
    #[arg(long, default_value_t = 30)]
    frames: u32,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    #[arg(long, default_value_t = 4_000)]
    kbps: u32,
    #[arg(long, default_value_t = 2)]
    passes: u8,
    #[arg(long, default_value_t = 1)]
    columns: u32,
    #[arg(long)]
    vdbox: Option<u8>,
    #[arg(long, default_value_t = 30)]
    gop: u32,
    #[arg(long, default_value_t = false)]
    unauthenticated: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    if args.gop == 0 {
        bail!("gop must be at least 1");
    }

    let platform = Platform::from(args.platform);
    let config = DriverConfig {
        platform: Some(platform),
        vdbox_count: args.vdbox,
        ..DriverConfig::default()
    }
    .resolve()
    .context("resolving driver config")?;

    let dims = Dimensions::new(args.width, args.height).context("frame size")?;
    let mut sequence = SequenceParams::for_dims(dims);
    sequence.target_bitrate_kbps = args.kbps;
    sequence.gop_length = args.gop;

    let mut features = FeatureConfig {
        rate_control_mode: args.mode.into(),
        max_brc_passes: args.passes,
        ..FeatureConfig::default()
    };
    let layout = (args.columns > 1).then(|| TileLayout::uniform(&sequence, args.columns, 1));
    let tile_slices = layout
        .as_ref()
        .map(TileLayout::slices)
        .transpose()
        .context("splitting the frame into tiles")?;
    if let Some(layout) = &layout {
        features.tiling_enabled = true;
        features.tile_layout = Some(layout.clone());
    }

    let options = SimOptions {
        firmware: if args.unauthenticated {
            FirmwareStatus::AuthenticationFailed
        } else {
            FirmwareStatus::Authenticated
        },
        settings: PlatformSettings::for_platform(platform),
        ..SimOptions::default()
    };
    let engine = Arc::new(SimEngine::with_options(Arc::new(HostMemory::new()), options));
    let mut session = EncodeSession::simulated(Arc::clone(&engine), config, features)
        .context("building encode session")?;

    let timeout = Duration::from_secs(10);
    let mut reports = Vec::new();
    for i in 0..args.frames {
        let picture_type = if i % args.gop == 0 { PictureType::I } else { PictureType::P };
        let mut frame = EncodeFrame::new(FrameSeq(i), picture_type, sequence.clone());
        if let Some(slices) = &tile_slices {
            frame = frame.with_slices(slices.clone());
        }
        frame.last_pic_in_stream = i + 1 == args.frames;
        match session.submit_blocking(&frame, timeout) {
            Ok(plan) => println!(
                "submit seq={} type={} passes={} pipes={} activations={}",
                i,
                picture_type,
                plan.num_passes,
                plan.num_pipes,
                plan.activations.len()
            ),
            Err(err) => println!("submit seq={i} rejected: {err}"),
        }
        while let Some(report) = session.try_reap()? {
            reports.push(report);
        }
    }
    reports.extend(session.flush(timeout)?);

    for report in &reports {
        match &report.error {
            None => println!(
                "report seq={} status={} bytes={} qp={} passes={} tiles={:?}",
                report.frame_seq,
                report.status,
                report.bitstream_bytes,
                report.qp,
                report.passes,
                report.tile_sizes
            ),
            Some(err) => println!("report seq={} status={} error={err}", report.frame_seq, report.status),
        }
    }

    let metrics = session.metrics();
    let stats = engine.stats();
    println!(
        "frames={} completed={} failed={} passes={} submissions={} huc_runs={} batch_ends={} hangs={}",
        metrics.frames_submitted,
        metrics.frames_completed,
        metrics.frames_failed,
        metrics.passes_executed,
        metrics.submissions,
        stats.huc_runs,
        stats.batch_ends_taken,
        stats.hangs
    );
    Ok(())
}

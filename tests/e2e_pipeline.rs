use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use vdenc_pipeline::{
    BuildContext, Capability, CodecStatus, CommandBuffer, CompletionContext, Dimensions,
    DriverConfig, EncodeFrame, EncodePacket, EncodeSession, FeatureConfig, FirmwareStatus,
    FrameSeq, FrameState, GpuAddress, HevcVdencPkt, HostMemory, HwCommand, MemoryServices,
    OrchestrationError, PacketKind, PictureType, PipelineController, RateControlMode,
    ResolvedConfig, ResourceSpec, RoiRegion, SemaphoreCompare, SequenceParams, SimEngine,
    SimOptions, SlotIndex, StatusReportData, TileLayout,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn sequence(target_kbps: u32) -> SequenceParams {
    let mut seq = SequenceParams::for_dims(Dimensions::new(1920, 1080).unwrap());
    seq.target_bitrate_kbps = target_kbps;
    seq
}

fn frame(seq: u32, sequence: &SequenceParams) -> EncodeFrame {
    let picture_type = if seq == 0 { PictureType::I } else { PictureType::P };
    EncodeFrame::new(FrameSeq(seq), picture_type, sequence.clone())
}

fn features(mode: RateControlMode, max_brc_passes: u8) -> FeatureConfig {
    FeatureConfig {
        rate_control_mode: mode,
        max_brc_passes,
        ..FeatureConfig::default()
    }
}

fn tiled(mut config: FeatureConfig, sequence: &SequenceParams, columns: u32) -> FeatureConfig {
    config.tiling_enabled = true;
    config.tile_layout = Some(TileLayout::uniform(sequence, columns, 1));
    config
}

fn tiled_frame(seq: u32, sequence: &SequenceParams, config: &FeatureConfig) -> EncodeFrame {
    let layout = config
        .tile_layout
        .as_ref()
        .expect("tiled config carries a layout");
    frame(seq, sequence).with_slices(layout.slices().unwrap())
}

fn resolved(vdbox: u8) -> ResolvedConfig {
    DriverConfig {
        vdbox_count: Some(vdbox),
        ..DriverConfig::default()
    }
    .resolve_with(|_| None)
    .expect("driver config should resolve")
}

fn session(config: FeatureConfig, vdbox: u8) -> (Arc<SimEngine>, EncodeSession) {
    let engine = Arc::new(SimEngine::new(Arc::new(HostMemory::new())));
    let session = EncodeSession::simulated(Arc::clone(&engine), resolved(vdbox), config)
        .expect("session should build");
    (engine, session)
}

fn encode_all(session: &mut EncodeSession, frames: &[EncodeFrame]) -> Vec<StatusReportData> {
    for f in frames {
        session
            .submit_blocking(f, TIMEOUT)
            .expect("frame should be accepted");
    }
    session.flush(TIMEOUT).expect("flush should drain the pipeline")
}

#[test]
fn cqp_frames_complete_in_one_pass() {
    let seq = sequence(4_000);
    let (engine, mut session) = session(FeatureConfig::default(), 1);
    let frames: Vec<_> = (0..3).map(|i| frame(i, &seq)).collect();
    let reports = encode_all(&mut session, &frames);

    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.frame_seq, FrameSeq(i as u32));
        assert_eq!(report.passes, 1);
        assert_eq!(report.qp, 26);
        assert!(report.bitstream_bytes > 0);
    }
    assert_eq!(engine.stats().huc_runs, 0);
    assert_eq!(session.controller().packet_activations(PacketKind::HucBrcUpdate), 0);
}

#[test]
fn brc_re_encodes_until_the_target_is_met() {
    // A low target makes the first pass overshoot the estimate badly.
    let seq = sequence(1_000);
    let (engine, mut session) = session(features(RateControlMode::Vbr, 2), 1);
    let frames: Vec<_> = (0..3).map(|i| frame(i, &seq)).collect();
    let reports = encode_all(&mut session, &frames);

    assert!(reports.iter().all(StatusReportData::is_ok), "{reports:?}");
    assert_eq!(reports[0].passes, 2);
    assert_eq!(reports[1].passes, 1);
    assert_eq!(reports[2].passes, 1);
    assert_eq!(reports[1].qp, reports[0].qp);
    let target = seq.target_frame_bits() / 8;
    let bytes = u64::from(reports[1].bitstream_bytes);
    assert!(bytes.abs_diff(target) * 10 <= target, "{bytes} vs {target}");

    // init once, then one update per planned pass
    assert_eq!(session.controller().packet_activations(PacketKind::HucBrcInit), 1);
    assert_eq!(session.controller().packet_activations(PacketKind::HucBrcUpdate), 6);
    assert_eq!(engine.stats().batch_ends_taken, 2);
}

#[test]
fn converged_frames_skip_later_passes_on_the_engine() {
    let seq = sequence(4_000);
    let (engine, mut session) = session(features(RateControlMode::Cbr, 3), 1);
    let reports = encode_all(&mut session, &[frame(0, &seq)]);
    assert_eq!(reports[0].passes, 1);
    // the first skipped pass ends the whole batch
    assert_eq!(engine.stats().batch_ends_taken, 1);
    assert_eq!(session.controller().metrics().passes_executed, 1);
}

#[rstest]
#[case::cqp(RateControlMode::Cqp, 4, 1)]
#[case::icq(RateControlMode::Icq, 4, 1)]
#[case::cbr(RateControlMode::Cbr, 2, 2)]
#[case::vbr(RateControlMode::Vbr, 3, 3)]
#[case::qvbr(RateControlMode::Qvbr, 9, 4)]
fn planned_passes_are_contiguous(
    #[case] mode: RateControlMode,
    #[case] max_passes: u8,
    #[case] expected: u8,
) {
    let seq = sequence(4_000);
    let (_engine, mut session) = session(features(mode, max_passes), 1);
    let plan = session
        .submit(&frame(0, &seq))
        .expect("frame should be accepted");
    assert_eq!(plan.num_passes, expected);

    let passes = plan.passes_of(PacketKind::VdencPicture);
    assert_eq!(passes, (0..expected).collect::<Vec<_>>());
    assert!(
        plan.activations
            .windows(2)
            .all(|w| w[0].pass <= w[1].pass)
    );
    assert!(plan.activations.last().is_some_and(|a| a.immediate_submit));
    session.flush(TIMEOUT).expect("flush");
}

#[rstest]
#[case::single_pipe(1, 1)]
#[case::two_pipes(2, 2)]
#[case::three_columns_two_engines(2, 1)]
fn tiled_frames_report_tile_sizes(#[case] vdbox: u8, #[case] expected_pipes: u8) {
    let seq = sequence(4_000);
    let columns = if expected_pipes == 1 && vdbox == 2 { 3 } else { 2 };
    let config = tiled(features(RateControlMode::Cbr, 2), &seq, columns);
    let (_engine, mut session) = session(config.clone(), vdbox);

    let first = tiled_frame(0, &seq, &config);
    let plan = session.submit(&first).expect("tiled frame should be accepted");
    assert_eq!(plan.num_pipes, expected_pipes);
    for pass in 0..plan.num_passes {
        let pipes: Vec<_> = plan
            .activations
            .iter()
            .filter(|a| a.pass == pass && a.packet == PacketKind::VdencPicture)
            .map(|a| a.pipe)
            .collect();
        assert_eq!(pipes, (0..expected_pipes).collect::<Vec<_>>());
        let integrate = plan
            .activations
            .iter()
            .position(|a| a.pass == pass && a.packet == PacketKind::PakIntegrate)
            .expect("integration runs every pass");
        let last_picture = plan
            .activations
            .iter()
            .rposition(|a| a.pass == pass && a.packet == PacketKind::VdencPicture)
            .expect("picture activations present");
        assert!(integrate > last_picture);
    }

    let reports = session.flush(TIMEOUT).expect("flush");
    let report = &reports[0];
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(report.tile_sizes.len(), columns as usize);
    assert!(report.tile_sizes.iter().all(|&s| s > 0));
    let total: u32 = report.tile_sizes.iter().sum();
    assert_eq!(total, report.bitstream_bytes);
}

#[test]
fn multi_pipe_frames_re_encode_in_lockstep() {
    let seq = sequence(1_000);
    let config = tiled(features(RateControlMode::Vbr, 2), &seq, 2);
    let (engine, mut session) = session(config.clone(), 2);
    let frames: Vec<_> = (0..4).map(|i| tiled_frame(i, &seq, &config)).collect();
    let reports = encode_all(&mut session, &frames);

    assert!(reports.iter().all(StatusReportData::is_ok), "{reports:?}");
    assert_eq!(reports[0].passes, 2);
    assert!(reports[1..].iter().all(|r| r.passes == 1));
    assert_eq!(engine.stats().hangs, 0);
}

#[rstest]
#[case::untiled(1, 1)]
#[case::two_pipes(2, 2)]
fn end_of_stream_is_inserted_once(#[case] vdbox: u8, #[case] columns: u32) {
    let seq = sequence(4_000);
    let config = if columns > 1 {
        tiled(FeatureConfig::default(), &seq, columns)
    } else {
        FeatureConfig::default()
    };
    let (engine, mut session) = session(config.clone(), vdbox);
    let mut last = if columns > 1 {
        tiled_frame(0, &seq, &config)
    } else {
        frame(0, &seq)
    };
    last.last_pic_in_stream = true;

    let plan = session.submit(&last).expect("frame should be accepted");
    assert_eq!(u32::from(plan.num_pipes), columns);
    session.flush(TIMEOUT).expect("flush");
    assert_eq!(engine.stats().eos_markers, 1);
}

#[test]
fn ring_slots_cycle_with_the_ring_depth() {
    let seq = sequence(4_000);
    let (_engine, mut session) = session(FeatureConfig::default(), 1);
    let depth = session.controller().config().ring_depth;
    let mut next = Vec::new();
    for i in 0..(depth * 2 + 1) as u32 {
        session
            .submit_blocking(&frame(i, &seq), TIMEOUT)
            .expect("frame should be accepted");
        let ring = session.controller().ring_snapshot();
        assert!(ring.in_flight <= ring.capacity);
        next.push(ring.next);
    }
    let expected: Vec<_> = (1..=depth * 2 + 1).map(|i| SlotIndex(i % depth)).collect();
    assert_eq!(next, expected);
    session.flush(TIMEOUT).expect("flush");
}

#[test]
fn full_ring_rejects_then_accepts_the_same_frame() {
    let seq = sequence(4_000);
    let (engine, mut session) = session(features(RateControlMode::Cbr, 2), 1);
    let depth = session.controller().config().ring_depth as u32;
    engine.pause();

    let mut plans = Vec::new();
    for i in 0..depth {
        plans.push(session.submit(&frame(i, &seq)).expect("slot available"));
    }
    let blocked = frame(depth, &seq);
    let err = session.submit(&blocked).unwrap_err();
    assert!(matches!(err, OrchestrationError::ResourceExhausted(_)));
    assert_eq!(session.controller().frame_state(blocked.seq), None);

    engine.resume();
    let retry = session
        .submit_blocking(&blocked, TIMEOUT)
        .expect("retry after a release");
    assert!(retry.same_shape(&plans[1]));

    let reports = session.flush(TIMEOUT).expect("flush");
    let seqs: Vec<_> = reports.iter().map(|r| r.frame_seq.0).collect();
    assert_eq!(seqs, (0..=depth).collect::<Vec<_>>());
}

#[test]
fn frame_sequence_survives_wraparound() {
    let seq = sequence(4_000);
    let (_engine, mut session) = session(FeatureConfig::default(), 1);
    let start = u32::MAX - 2;
    let frames: Vec<_> = (0..5u32)
        .map(|i| frame(start.wrapping_add(i), &seq))
        .collect();
    let reports = encode_all(&mut session, &frames);
    let seqs: Vec<_> = reports.iter().map(|r| r.frame_seq).collect();
    let expected: Vec<_> = frames.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, expected);
    assert!(reports.iter().all(StatusReportData::is_ok), "{reports:?}");
}

#[test]
fn lookahead_and_roi_frames_complete() {
    let seq = sequence(4_000);
    let config = FeatureConfig {
        lookahead_depth: 4,
        roi_regions: vec![RoiRegion {
            left: 0,
            top: 0,
            right: 640,
            bottom: 360,
            priority: 2,
        }],
        ..features(RateControlMode::Cbr, 2)
    };
    let (_engine, mut session) = session(config, 1);
    let frames: Vec<_> = (0..3).map(|i| frame(i, &seq)).collect();
    let reports = encode_all(&mut session, &frames);
    for report in &reports {
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.lookahead_bytes, report.bitstream_bytes);
    }
}

#[test]
fn unauthenticated_firmware_fails_brc_frames_before_submission() {
    let memory = Arc::new(HostMemory::new());
    let engine = Arc::new(SimEngine::with_options(
        Arc::clone(&memory),
        SimOptions {
            firmware: FirmwareStatus::AuthenticationFailed,
            ..SimOptions::default()
        },
    ));
    let mut session = EncodeSession::simulated(
        Arc::clone(&engine),
        resolved(1),
        features(RateControlMode::Vbr, 2),
    )
    .expect("session should build");

    let seq = sequence(4_000);
    let err = session.submit(&frame(0, &seq)).unwrap_err();
    assert!(matches!(err, OrchestrationError::HardwareRejected(_)));
    assert_eq!(
        session.controller().frame_state(FrameSeq(0)),
        Some(FrameState::Failed)
    );
    assert_eq!(engine.stats().jobs, 0);

    // Constant QP needs no firmware and keeps working.
    session
        .set_feature_config(&FeatureConfig::default())
        .expect("reconfigure");
    let reports = encode_all(&mut session, &[frame(1, &seq)]);
    assert!(reports[0].is_ok());
}

/// Picture packet that never finishes one chosen frame.
struct HangingPicture {
    inner: HevcVdencPkt,
    hang_on: FrameSeq,
    never: GpuAddress,
}

impl EncodePacket for HangingPicture {
    fn kind(&self) -> PacketKind {
        PacketKind::VdencPicture
    }

    fn capabilities(&self) -> &'static [Capability] {
        self.inner.capabilities()
    }

    fn build(
        &mut self,
        ctx: &BuildContext<'_>,
        cb: &mut CommandBuffer,
    ) -> vdenc_pipeline::Result<()> {
        self.inner.build(ctx, cb)?;
        if ctx.frame.seq == self.hang_on {
            cb.emit(HwCommand::SemaphoreWait {
                addr: self.never,
                compare: SemaphoreCompare::Equal,
                value: 1,
            })?;
        }
        Ok(())
    }

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> vdenc_pipeline::Result<()> {
        self.inner.completed(ctx, report)
    }

    fn activations(&self) -> u64 {
        self.inner.activations()
    }
}

#[test]
fn hung_frame_fails_without_disturbing_its_neighbours() {
    let memory = Arc::new(HostMemory::new());
    let never = memory
        .allocate(&ResourceSpec::new("never_signalled", 8))
        .expect("allocate");
    let engine = Arc::new(SimEngine::new(Arc::clone(&memory)));
    let controller = PipelineController::builder()
        .config(resolved(1))
        .queue(engine.clone())
        .memory(memory)
        .packet(Box::new(HangingPicture {
            inner: HevcVdencPkt::default(),
            hang_on: FrameSeq(1),
            never: GpuAddress::new(never, 0),
        }))
        .build()
        .expect("controller should build");
    let mut session = EncodeSession::new(controller);

    let seq = sequence(4_000);
    let frames: Vec<_> = (0..3).map(|i| frame(i, &seq)).collect();
    let reports = encode_all(&mut session, &frames);

    assert_eq!(reports.len(), 3);
    assert!(reports[0].is_ok());
    assert_eq!(reports[1].status, CodecStatus::Error);
    assert!(matches!(
        reports[1].error,
        Some(OrchestrationError::HardwareRejected(_))
    ));
    assert!(reports[2].is_ok());
    assert_eq!(engine.stats().hangs, 1);
    assert_eq!(
        session.controller().frame_state(FrameSeq(1)),
        Some(FrameState::Failed)
    );
    assert_eq!(session.controller().ring_snapshot().in_flight, 0);
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod brc;
mod command;
mod config;
mod contract;
mod feature;
mod huc_brc;
mod pak_integrate;
mod packet;
mod pipeline;
mod platform;
mod queue;
mod resource;
mod ring;
mod scalability;
mod sim;
mod status;
#[cfg(test)]
mod test_support;
mod tile;
mod vdenc_packet;

pub use brc::{BrcDecision, BrcFeature, BrcInitParams, BrcUpdateParams, initial_qp};
pub use command::{
    AtomicOp, CommandBuffer, EosKind, HucFirmware, HwCommand, Register, SemaphoreCompare,
    TileCoding,
};
pub use config::{DriverConfig, ENV_METRICS, ENV_SINGLE_TASK_PHASE, ResolvedConfig};
pub use contract::{
    Dimensions, EncodeFrame, FeatureConfig, Fence, FirmwareStatus, FrameSeq, MAX_QP,
    MAX_ROI_REGIONS, OrchestrationError, PictureType, RateControlMode, Result, RoiRegion,
    SequenceParams, SliceParams, Submission, TaskHandle, TaskKind, TaskQueue, TileLayout,
};
pub use feature::{
    Feature, FeatureSet, FeatureTag, FrameFeatures, LookaheadDecision, LookaheadFeature,
    RoiFeature,
};
pub use huc_brc::{HucBrcInitPkt, HucBrcUpdatePkt};
pub use pak_integrate::PakIntegratePkt;
pub use packet::{
    Activation, BuildContext, Capability, CompletionContext, EncodePacket, PacketKind, PassContext,
};
pub use pipeline::{
    ActivationPlan, FrameState, PipelineBuilder, PipelineController, PipelineMetrics, plan_frame,
};
pub use platform::{Platform, PlatformSettings};
pub use queue::{JobQueueRx, JobQueueStats, JobQueueTx, JobSendError, job_queue};
pub use resource::{
    GpuAddress, HostMemory, LockMode, MemoryServices, ResourceHandle, ResourceSpec, ScopedLock,
};
pub use ring::{ResourceRing, RingSnapshot, SlotIndex, SlotResources};
pub use scalability::{PipeContext, PipeRole, Scalability};
pub use sim::{RecordedSubmission, RecordingQueue, SimEngine, SimOptions, SimStats};
pub use status::{CodecStatus, StatusField, StatusRecord, StatusReportData};
pub use tile::{TileFeature, TileGrid, TileInfo};
pub use vdenc_packet::HevcVdencPkt;

/// Caller-facing encode session: frames go in with `submit`, status reports
/// come out in submission order.
#[derive(Debug)]
pub struct EncodeSession {
    controller: PipelineController,
    ready: VecDeque<StatusReportData>,
}

impl EncodeSession {
    pub fn new(controller: PipelineController) -> Self {
        Self {
            controller,
            ready: VecDeque::new(),
        }
    }

    /// Session over an in-process simulated engine sharing its host memory.
    pub fn simulated(
        engine: Arc<SimEngine>,
        config: ResolvedConfig,
        features: FeatureConfig,
    ) -> Result<Self> {
        let memory: Arc<dyn MemoryServices> = engine.memory().clone();
        let controller = PipelineController::builder()
            .config(config)
            .features(features)
            .queue(engine)
            .memory(memory)
            .build()?;
        Ok(Self::new(controller))
    }

    pub fn controller(&self) -> &PipelineController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut PipelineController {
        &mut self.controller
    }

    pub fn set_feature_config(&mut self, config: &FeatureConfig) -> Result<()> {
        self.controller.set_feature_config(config)
    }

    fn collect(&mut self) -> Result<()> {
        let done = self.controller.poll_completions()?;
        self.ready.extend(done);
        Ok(())
    }

    /// Submits one frame. `ResourceExhausted` means the ring is full and the
    /// same frame may be submitted again later.
    pub fn submit(&mut self, frame: &EncodeFrame) -> Result<ActivationPlan> {
        self.collect()?;
        self.controller.activate_frame(frame)
    }

    /// Like [`EncodeSession::submit`], but reaps completions while the ring is
    /// full until `timeout` runs out.
    pub fn submit_blocking(
        &mut self,
        frame: &EncodeFrame,
        timeout: Duration,
    ) -> Result<ActivationPlan> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.submit(frame) {
                Err(err) if err.is_recoverable() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || self.controller.in_flight() == 0 {
                        return Err(err);
                    }
                    let done = self.controller.wait_for_completion(remaining)?;
                    self.ready.extend(done);
                }
                other => return other,
            }
        }
    }

    pub fn try_reap(&mut self) -> Result<Option<StatusReportData>> {
        if self.ready.is_empty() {
            self.collect()?;
        }
        Ok(self.ready.pop_front())
    }

    pub fn reap_timeout(&mut self, timeout: Duration) -> Result<Option<StatusReportData>> {
        if let Some(report) = self.try_reap()? {
            return Ok(Some(report));
        }
        let done = self.controller.wait_for_completion(timeout)?;
        self.ready.extend(done);
        Ok(self.ready.pop_front())
    }

    /// Waits for every in-flight frame and returns all pending reports.
    pub fn flush(&mut self, timeout: Duration) -> Result<Vec<StatusReportData>> {
        let done = self.controller.flush(timeout)?;
        self.ready.extend(done);
        Ok(std::mem::take(&mut self.ready).into_iter().collect())
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.controller.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u32, picture_type: PictureType) -> EncodeFrame {
        let sequence = SequenceParams::for_dims(Dimensions::new(640, 360).unwrap());
        EncodeFrame::new(FrameSeq(seq), picture_type, sequence)
    }

    fn session(features: FeatureConfig) -> (Arc<SimEngine>, EncodeSession) {
        let engine = Arc::new(SimEngine::new(Arc::new(HostMemory::new())));
        let session =
            EncodeSession::simulated(Arc::clone(&engine), ResolvedConfig::default(), features)
                .unwrap();
        (engine, session)
    }

    #[test]
    fn reports_come_back_in_submission_order() {
        let (_engine, mut session) = session(FeatureConfig::default());
        for seq in 0..4 {
            let picture_type = if seq == 0 { PictureType::I } else { PictureType::P };
            session.submit(&frame(seq, picture_type)).unwrap();
        }
        let reports = session.flush(Duration::from_secs(5)).unwrap();
        let seqs: Vec<_> = reports.iter().map(|r| r.frame_seq.0).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert!(reports.iter().all(StatusReportData::is_ok));
    }

    #[test]
    fn submit_blocking_waits_out_a_full_ring() {
        let (engine, mut session) = session(FeatureConfig::default());
        let depth = session.controller().config().ring_depth as u32;
        engine.pause();
        for seq in 0..depth {
            session.submit(&frame(seq, PictureType::P)).unwrap();
        }
        let err = session.submit(&frame(depth, PictureType::P)).unwrap_err();
        assert!(err.is_recoverable());

        engine.resume();
        session
            .submit_blocking(&frame(depth, PictureType::P), Duration::from_secs(5))
            .unwrap();
        let reports = session.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(reports.len(), depth as usize + 1);
        assert!(session.metrics().backpressure_events >= 1);
    }

    #[test]
    fn reap_timeout_returns_none_when_idle() {
        let (_engine, mut session) = session(FeatureConfig::default());
        assert_eq!(session.reap_timeout(Duration::from_millis(10)).unwrap(), None);
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{CommandBuffer, HwCommand};
use crate::config::ResolvedConfig;
use crate::contract::{
    EncodeFrame, FeatureConfig, Fence, FirmwareStatus, FrameSeq, OrchestrationError, Result,
    Submission, TaskHandle, TaskKind, TaskQueue,
};
use crate::feature::{FeatureSet, FrameFeatures};
use crate::huc_brc::{HucBrcInitPkt, HucBrcUpdatePkt};
use crate::packet::{
    Activation, BuildContext, CompletionContext, EncodePacket, PacketKind, PassContext,
};
use crate::pak_integrate::PakIntegratePkt;
use crate::resource::MemoryServices;
use crate::ring::{ResourceRing, RingSnapshot, SlotIndex, SlotResources};
use crate::scalability::{PipeContext, Scalability};
use crate::status::{ReportHandle, StatusField, StatusRecord, StatusReport, StatusReportData};
use crate::vdenc_packet::HevcVdencPkt;

const FINISHED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    Idle,
    Activating,
    Submitted,
    AwaitingCompletion,
    Completed,
    Failed,
}

impl FrameState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (from, Self::Failed) => !from.is_terminal(),
            (Self::Idle, Self::Activating)
            | (Self::Activating, Self::Submitted)
            | (Self::Submitted, Self::AwaitingCompletion)
            | (Self::AwaitingCompletion, Self::Completed) => true,
            _ => false,
        }
    }

    pub fn advance(self, next: Self) -> Result<Self> {
        if self.can_become(next) {
            Ok(next)
        } else {
            Err(OrchestrationError::InvalidConfiguration(format!(
                "frame state {self:?} cannot become {next:?}"
            )))
        }
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ordered packet activations decided for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationPlan {
    pub seq: FrameSeq,
    pub activations: Vec<Activation>,
    pub num_passes: u8,
    pub num_pipes: u8,
    /// All activations share one submission.
    pub batched: bool,
}

impl ActivationPlan {
    pub fn count(&self, packet: PacketKind) -> usize {
        self.activations.iter().filter(|a| a.packet == packet).count()
    }

    pub fn passes_of(&self, packet: PacketKind) -> Vec<u8> {
        self.activations
            .iter()
            .filter(|a| a.packet == packet)
            .map(|a| a.pass)
            .collect()
    }

    pub fn packets(&self) -> BTreeSet<PacketKind> {
        self.activations.iter().map(|a| a.packet).collect()
    }

    /// Same activations, ignoring which frame they belong to.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.activations == other.activations
            && self.num_passes == other.num_passes
            && self.num_pipes == other.num_pipes
            && self.batched == other.batched
    }
}

/// Firmware init, then per pass: firmware update, one picture build per pipe
/// and tile integration on the last pipe.
pub fn plan_frame(
    seq: FrameSeq,
    features: &FrameFeatures,
    num_pipes: u8,
    batched: bool,
) -> ActivationPlan {
    let num_pipes = num_pipes.max(1);
    let num_passes = features.num_passes().max(1);
    let mut activations = Vec::new();
    let mut push = |packet, pass, pipe| {
        activations.push(Activation {
            packet,
            pass,
            pipe,
            immediate_submit: !batched,
        })
    };

    if features.brc.init_required {
        push(PacketKind::HucBrcInit, 0, 0);
    }
    for pass in 0..num_passes {
        if features.brc.firmware {
            push(PacketKind::HucBrcUpdate, pass, 0);
        }
        for pipe in 0..num_pipes {
            push(PacketKind::VdencPicture, pass, pipe);
        }
        if features.tiles.is_some() {
            push(PacketKind::PakIntegrate, pass, num_pipes - 1);
        }
    }
    if let Some(last) = activations.last_mut() {
        last.immediate_submit = true;
    }

    ActivationPlan {
        seq,
        activations,
        num_passes,
        num_pipes,
        batched,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub frames_submitted: u64,
    pub frames_completed: u64,
    pub frames_failed: u64,
    pub activations: u64,
    pub submissions: u64,
    pub passes_executed: u64,
    pub backpressure_events: u64,
}

#[derive(Debug)]
struct InFlightFrame {
    seq: FrameSeq,
    slot: SlotIndex,
    report: ReportHandle,
    fence: Fence,
    features: FrameFeatures,
    num_pipes: u8,
    packets: BTreeSet<PacketKind>,
    state: FrameState,
    submitted_at: Instant,
}

/// Top-level scheduler: turns frames into activation lists, builds and
/// submits their command buffers, and reaps completions in order.
pub struct PipelineController {
    config: ResolvedConfig,
    queue: Arc<dyn TaskQueue>,
    memory: Arc<dyn MemoryServices>,
    task: TaskHandle,
    features: FeatureSet,
    ring: ResourceRing<SlotResources>,
    status: StatusReport,
    scalability: Scalability,
    packets: BTreeMap<PacketKind, Box<dyn EncodePacket>>,
    in_flight: VecDeque<InFlightFrame>,
    finished: VecDeque<(FrameSeq, FrameState)>,
    firmware_checked: bool,
    metrics: PipelineMetrics,
}

impl PipelineController {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn feature_config(&self) -> &FeatureConfig {
        self.features.config()
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics
    }

    pub fn ring_snapshot(&self) -> RingSnapshot {
        self.ring.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }

    pub fn packet_activations(&self, kind: PacketKind) -> u64 {
        self.packets.get(&kind).map_or(0, |p| p.activations())
    }

    pub fn frame_state(&self, seq: FrameSeq) -> Option<FrameState> {
        self.in_flight
            .iter()
            .find(|f| f.seq == seq)
            .map(|f| f.state)
            .or_else(|| {
                self.finished
                    .iter()
                    .rev()
                    .find(|(s, _)| *s == seq)
                    .map(|(_, state)| *state)
            })
    }

    /// Replaces the feature configuration for frames activated from now on.
    pub fn set_feature_config(&mut self, config: &FeatureConfig) -> Result<()> {
        self.features
            .reconfigure(config, &self.config.settings, self.memory.as_ref())?;
        self.release_retired();
        Ok(())
    }

    fn release_retired(&mut self) {
        if !self.in_flight.is_empty() || self.features.retired_resources() == 0 {
            return;
        }
        if let Err(err) = self.features.release_retired(self.memory.as_ref()) {
            warn!(%err, "freeing retired feature buffers failed");
        }
    }

    /// Evaluates, plans, builds and submits one frame. Nothing is submitted
    /// when any step fails, and feature state only moves on success.
    pub fn activate_frame(&mut self, frame: &EncodeFrame) -> Result<ActivationPlan> {
        let mut state = FrameState::Idle.advance(FrameState::Activating)?;
        match self.activate(frame, &mut state) {
            Ok(plan) => Ok(plan),
            Err(err) => {
                if err.is_recoverable() {
                    self.metrics.backpressure_events += 1;
                    debug!(seq = %frame.seq, %err, "frame deferred");
                } else {
                    self.metrics.frames_failed += 1;
                    warn!(seq = %frame.seq, %state, %err, "frame activation failed");
                    self.remember(frame.seq, FrameState::Failed);
                }
                Err(err)
            }
        }
    }

    fn activate(&mut self, frame: &EncodeFrame, state: &mut FrameState) -> Result<ActivationPlan> {
        let features = self.features.evaluate(frame)?;
        let num_pipes = self.scalability.num_pipes(features.tiles.as_ref());
        // Pipes rendezvous inside the command stream, so they must share a submission.
        let batched = self.config.single_task_phase || num_pipes > 1;
        let plan = plan_frame(frame.seq, &features, num_pipes, batched);
        if self.plan_runs_firmware(&plan, &features) {
            self.check_firmware()?;
        }

        let slot = self.ring.try_acquire()?;
        let (report, fence) = match self.submit_in_slot(frame, &features, &plan, slot) {
            Ok(done) => done,
            Err(err) => {
                if let Err(release_err) = self.ring.abandon(slot) {
                    warn!(%slot, %release_err, "abandoning slot failed");
                }
                return Err(err);
            }
        };
        *state = state.advance(FrameState::Submitted)?;
        self.ring.set_fence(slot, fence)?;
        self.features.commit(frame, &features);

        self.metrics.frames_submitted += 1;
        self.metrics.activations += plan.activations.len() as u64;
        debug!(
            seq = %frame.seq,
            %slot,
            %fence,
            passes = plan.num_passes,
            pipes = plan.num_pipes,
            activations = plan.activations.len(),
            "frame submitted"
        );
        self.in_flight.push_back(InFlightFrame {
            seq: frame.seq,
            slot,
            report,
            fence,
            features,
            num_pipes,
            packets: plan.packets(),
            state: state.advance(FrameState::AwaitingCompletion)?,
            submitted_at: Instant::now(),
        });
        Ok(plan)
    }

    fn plan_runs_firmware(&self, plan: &ActivationPlan, features: &FrameFeatures) -> bool {
        plan.packets().iter().any(|kind| {
            self.packets
                .get(kind)
                .is_some_and(|p| p.runs_firmware(features, plan.num_pipes))
        })
    }

    fn check_firmware(&mut self) -> Result<()> {
        if self.firmware_checked {
            return Ok(());
        }
        match self.queue.firmware_status() {
            FirmwareStatus::Authenticated => {
                self.firmware_checked = true;
                Ok(())
            }
            status => Err(OrchestrationError::HardwareRejected(format!(
                "huc firmware unusable: {status:?}"
            ))),
        }
    }

    fn wait_hazard(&self, slot: SlotIndex) -> Result<()> {
        let Some(fence) = self.ring.last_fence(slot) else {
            return Ok(());
        };
        if self.queue.is_signaled(fence) {
            return Ok(());
        }
        debug!(%slot, %fence, "waiting for previous use of slot");
        if self.queue.wait(fence, self.config.hazard_wait)? {
            Ok(())
        } else {
            Err(OrchestrationError::ResourceExhausted(format!(
                "{slot} still in use by {fence} after {:?}",
                self.config.hazard_wait
            )))
        }
    }

    fn submit_in_slot(
        &mut self,
        frame: &EncodeFrame,
        features: &FrameFeatures,
        plan: &ActivationPlan,
        slot: SlotIndex,
    ) -> Result<(ReportHandle, Fence)> {
        self.wait_hazard(slot)?;
        let record = self
            .ring
            .get(slot)
            .map(|r| r.status_record)
            .ok_or_else(|| OrchestrationError::InvalidConfiguration(format!("no {slot}")))?;
        let report = self.status.begin(frame.seq, slot, record)?;

        let submissions = match self.build_submissions(frame, features, plan, slot, &report) {
            Ok(built) => built,
            Err(err) => {
                self.status.discard(&report);
                return Err(err);
            }
        };

        let mut last = None;
        for (submission, immediate) in submissions {
            match self.queue.submit(self.task, submission, immediate) {
                Ok(fence) => {
                    self.metrics.submissions += 1;
                    last = Some(fence);
                }
                Err(err) => {
                    // Work already queued keeps the slot busy until it retires.
                    if let Some(fence) = last {
                        self.ring.set_fence(slot, fence)?;
                    }
                    self.status.discard(&report);
                    return Err(err);
                }
            }
        }
        let fence = last.ok_or_else(|| {
            OrchestrationError::InvalidConfiguration(format!("{} produced no submission", frame.seq))
        })?;
        Ok((report, fence))
    }

    fn build_submissions(
        &mut self,
        frame: &EncodeFrame,
        features: &FrameFeatures,
        plan: &ActivationPlan,
        slot: SlotIndex,
        report: &ReportHandle,
    ) -> Result<Vec<(Submission, bool)>> {
        let capacity = self.config.settings.command_buffer_dwords;
        let brc_history = self.features.brc()?.history_address();
        let lookahead_stats = match (features.lookahead, self.features.lookahead()) {
            (Some(decision), Some(la)) => Some(la.stats_address(decision.stats_entry)),
            _ => None,
        };
        let resources = self
            .ring
            .get(slot)
            .ok_or_else(|| OrchestrationError::InvalidConfiguration(format!("no {slot}")))?;

        let mut submissions = Vec::new();
        let mut current = Submission::with_pipes(usize::from(plan.num_pipes), capacity);
        for activation in &plan.activations {
            let packet = self.packets.get_mut(&activation.packet).ok_or_else(|| {
                OrchestrationError::NullDependency(format!(
                    "no {} packet registered",
                    activation.packet
                ))
            })?;
            let pipe_buffer = current
                .pipes
                .get_mut(usize::from(activation.pipe))
                .ok_or_else(|| {
                    OrchestrationError::InvalidConfiguration(format!(
                        "activation on pipe {} of {}",
                        activation.pipe, plan.num_pipes
                    ))
                })?;
            let ctx = BuildContext {
                frame,
                features,
                pass: PassContext {
                    index: activation.pass,
                    num_passes: plan.num_passes,
                },
                pipe: PipeContext::new(activation.pipe, plan.num_pipes),
                slot: resources,
                report,
                scalability: &self.scalability,
                memory: self.memory.as_ref(),
                settings: &self.config.settings,
                brc_history,
                lookahead_stats,
                first_in_phase: pipe_buffer.is_empty(),
                batching: plan.batched,
            };
            let mut segment = CommandBuffer::with_capacity(capacity);
            packet.build(&ctx, &mut segment)?;
            debug!(
                seq = %frame.seq,
                packet = %activation.packet,
                pass = activation.pass,
                pipe = activation.pipe,
                dwords = segment.used_dwords(),
                "activation built"
            );
            pipe_buffer.append(segment)?;

            if activation.immediate_submit {
                let next = Submission::with_pipes(usize::from(plan.num_pipes), capacity);
                submissions.push((std::mem::replace(&mut current, next), true));
            }
        }
        if !current.is_empty() {
            submissions.push((current, false));
        }

        let tag = self.status.tag_address();
        let last_index = submissions.len().saturating_sub(1);
        for (index, (submission, _)) in submissions.iter_mut().enumerate() {
            let last_pipe = submission.pipes.len() - 1;
            for (pipe, cb) in submission.pipes.iter_mut().enumerate() {
                cb.emit(HwCommand::BatchBufferEnd)?;
                if index == last_index && pipe == last_pipe {
                    cb.emit_epilogue(HwCommand::StoreDataImm {
                        addr: report.address(StatusField::QueryEnd),
                        value: frame.seq.0,
                    })?;
                    cb.emit_epilogue(HwCommand::StoreDataImm {
                        addr: tag,
                        value: frame.seq.0,
                    })?;
                    cb.emit_epilogue(HwCommand::StoreDataImm {
                        addr: tag.add(4),
                        value: 1,
                    })?;
                }
            }
        }
        Ok(submissions)
    }

    /// Completes every frame the hardware has finished, oldest first.
    pub fn poll_completions(&mut self) -> Result<Vec<StatusReportData>> {
        let mut reports = Vec::new();
        while let Some(front) = self.in_flight.front() {
            if !self.queue.is_signaled(front.fence) {
                break;
            }
            let reached = self.status.poll()?;
            if reached.is_empty() {
                // Fence retired but the tag never moved: the engine gave up on the frame.
                let Some(frame) = self.in_flight.pop_front() else {
                    break;
                };
                self.status.discard(&frame.report);
                let err = OrchestrationError::HardwareRejected(format!(
                    "{} retired on {} without reaching its status tag",
                    frame.seq, frame.fence
                ));
                let data = StatusReportData::failed(frame.seq, err);
                reports.push(self.finish(frame, None, data)?);
                continue;
            }
            for handle in reached {
                let Some(frame) = self.in_flight.pop_front() else {
                    return Err(OrchestrationError::Collaborator(format!(
                        "status tag reached {} with nothing in flight",
                        handle.seq
                    )));
                };
                if frame.seq != handle.seq {
                    return Err(OrchestrationError::Collaborator(format!(
                        "completion order broken: expected {}, tag reached {}",
                        frame.seq, handle.seq
                    )));
                }
                let record = self.status.read(&handle)?;
                let data = self.status.complete(&handle, &record);
                reports.push(self.finish(frame, Some(record), data)?);
            }
        }
        self.release_retired();
        Ok(reports)
    }

    fn finish(
        &mut self,
        mut frame: InFlightFrame,
        record: Option<StatusRecord>,
        mut data: StatusReportData,
    ) -> Result<StatusReportData> {
        data.frame_seq = frame.seq;
        if let Some(record) = record.as_ref() {
            let resources = self.ring.get(frame.slot).ok_or_else(|| {
                OrchestrationError::InvalidConfiguration(format!("no {}", frame.slot))
            })?;
            let ctx = CompletionContext {
                features: &frame.features,
                num_pipes: frame.num_pipes,
                slot: resources,
                record,
                memory: self.memory.as_ref(),
                settings: &self.config.settings,
            };
            for kind in &frame.packets {
                if let Some(packet) = self.packets.get_mut(kind) {
                    packet.completed(&ctx, &mut data)?;
                }
            }
        }
        self.features.on_frame_completed(&data);
        self.ring.release(frame.slot)?;

        let outcome = if data.is_ok() {
            FrameState::Completed
        } else {
            FrameState::Failed
        };
        frame.state = frame.state.advance(outcome)?;
        self.remember(frame.seq, frame.state);
        if data.is_ok() {
            self.metrics.frames_completed += 1;
            self.metrics.passes_executed += u64::from(data.passes);
        } else {
            self.metrics.frames_failed += 1;
        }

        let elapsed = frame.submitted_at.elapsed();
        match &data.error {
            Some(err) => warn!(seq = %frame.seq, %err, "frame failed on the engine"),
            None => debug!(
                seq = %frame.seq,
                bytes = data.bitstream_bytes,
                qp = data.qp,
                passes = data.passes,
                ?elapsed,
                "frame complete"
            ),
        }
        if self.config.metrics {
            let m = &self.metrics;
            info!(
                submitted = m.frames_submitted,
                completed = m.frames_completed,
                failed = m.frames_failed,
                activations = m.activations,
                submissions = m.submissions,
                passes = m.passes_executed,
                backpressure = m.backpressure_events,
                "pipeline metrics"
            );
        }
        Ok(data)
    }

    fn remember(&mut self, seq: FrameSeq, state: FrameState) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((seq, state));
    }

    /// Waits for the oldest in-flight frame, then reaps whatever finished.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> Result<Vec<StatusReportData>> {
        let Some(front) = self.in_flight.front() else {
            return Ok(Vec::new());
        };
        self.queue.wait(front.fence, timeout)?;
        self.poll_completions()
    }

    pub fn flush(&mut self, timeout: Duration) -> Result<Vec<StatusReportData>> {
        let deadline = Instant::now() + timeout;
        let mut reports = Vec::new();
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestrationError::Collaborator(format!(
                    "{} frames still in flight after {timeout:?}",
                    self.in_flight.len()
                )));
            }
            reports.extend(self.wait_for_completion(remaining)?);
        }
        Ok(reports)
    }
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("task", &self.task)
            .field("ring", &self.ring.snapshot())
            .field("in_flight", &self.in_flight.len())
            .field("packets", &self.packets.keys().collect::<Vec<_>>())
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Collects the collaborators and configuration of a controller. The four
/// HEVC VDENC packets are registered unless replaced.
#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<ResolvedConfig>,
    features: FeatureConfig,
    queue: Option<Arc<dyn TaskQueue>>,
    memory: Option<Arc<dyn MemoryServices>>,
    packets: Vec<Box<dyn EncodePacket>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: ResolvedConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn features(mut self, features: FeatureConfig) -> Self {
        self.features = features;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryServices>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Registers a packet, replacing the default of the same kind.
    pub fn packet(mut self, packet: Box<dyn EncodePacket>) -> Self {
        self.packets.push(packet);
        self
    }

    pub fn build(self) -> Result<PipelineController> {
        let queue = self.queue.ok_or_else(|| {
            OrchestrationError::NullDependency("pipeline built without a task queue".to_string())
        })?;
        let memory = self.memory.ok_or_else(|| {
            OrchestrationError::NullDependency(
                "pipeline built without memory services".to_string(),
            )
        })?;
        let config = self.config.unwrap_or_default();
        let settings = config.settings;

        let mut packets: BTreeMap<PacketKind, Box<dyn EncodePacket>> = BTreeMap::new();
        let defaults: [Box<dyn EncodePacket>; 4] = [
            Box::new(HucBrcInitPkt::default()),
            Box::new(HucBrcUpdatePkt::default()),
            Box::new(HevcVdencPkt::default()),
            Box::new(PakIntegratePkt::default()),
        ];
        for packet in defaults.into_iter().chain(self.packets) {
            packets.insert(packet.kind(), packet);
        }

        let slots = (0..config.ring_depth)
            .map(|index| SlotResources::allocate(memory.as_ref(), index, settings.max_brc_passes))
            .collect::<Result<Vec<_>>>()?;
        let ring = ResourceRing::new(slots)?;
        let features = FeatureSet::new(&self.features, &settings, memory.as_ref())?;
        let scalability = Scalability::new(&settings, config.vdbox_count, memory.as_ref())?;
        let status = StatusReport::new(Arc::clone(&memory))?;
        let task = queue.create_task(TaskKind::VdboxEncode)?;
        info!(
            platform = %settings.platform,
            ring_depth = config.ring_depth,
            vdbox = config.vdbox_count,
            single_task_phase = config.single_task_phase,
            "encode pipeline ready"
        );

        Ok(PipelineController {
            config,
            queue,
            memory,
            task,
            features,
            ring,
            status,
            scalability,
            packets,
            in_flight: VecDeque::new(),
            finished: VecDeque::with_capacity(FINISHED_HISTORY),
            firmware_checked: false,
            metrics: PipelineMetrics::default(),
        })
    }
}

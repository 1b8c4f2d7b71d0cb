use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::brc::{BRC_FLAG_ICQ, history, init_dmem, update_dmem};
use crate::command::{AtomicOp, HucFirmware, HwCommand, Register};
use crate::contract::{
    Fence, FirmwareStatus, OrchestrationError, Result, Submission, TaskHandle, TaskKind, TaskQueue,
};
use crate::platform::PlatformSettings;
use crate::queue::{JobQueueRx, JobQueueStats, JobQueueTx, job_queue};
use crate::resource::{GpuAddress, HostMemory};
use crate::ring::{PASS_STATS_BYTES, TILE_STATS_BYTES};

/// Bytes one LCU costs at QP 26.
const LCU_BYTES_AT_QP26: f64 = 48.0;
/// Relative distance from the target size the firmware accepts.
const SIZE_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions {
    pub firmware: FirmwareStatus,
    pub settings: PlatformSettings,
    pub queue_depth: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            firmware: FirmwareStatus::Authenticated,
            settings: PlatformSettings::default(),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub jobs: u64,
    pub commands: u64,
    pub huc_runs: u64,
    pub batch_ends_taken: u64,
    pub eos_markers: u64,
    pub hangs: u64,
}

#[derive(Debug)]
enum SimTask {
    Job { fence: Fence, submission: Submission },
    Shutdown,
}

#[derive(Debug, Default)]
struct EngineState {
    completed: u64,
    paused: bool,
    stats: SimStats,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<EngineState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("sim engine poisoned".to_string()))
    }
}

/// In-process video engine. Executes submissions on a worker thread against
/// [`HostMemory`], running every pipe of a submission cooperatively so the
/// semaphore rendezvous between pipes behaves as on hardware.
#[derive(Debug)]
pub struct SimEngine {
    options: SimOptions,
    memory: Arc<HostMemory>,
    shared: Arc<Shared>,
    jobs: JobQueueTx<SimTask>,
    next_fence: AtomicU64,
    next_task: AtomicU32,
    worker: Option<JoinHandle<()>>,
}

impl SimEngine {
    pub fn new(memory: Arc<HostMemory>) -> Self {
        Self::with_options(memory, SimOptions::default())
    }

    pub fn with_options(memory: Arc<HostMemory>, options: SimOptions) -> Self {
        let (jobs, rx) = job_queue(options.queue_depth.max(1));
        let shared = Arc::new(Shared::default());
        let executor = Executor {
            memory: Arc::clone(&memory),
            authenticated: options.firmware == FirmwareStatus::Authenticated,
            settings: options.settings,
        };
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || run_engine(executor, rx, worker_shared));
        Self {
            options,
            memory,
            shared,
            jobs,
            next_fence: AtomicU64::new(1),
            next_task: AtomicU32::new(1),
            worker: Some(worker),
        }
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// Holds back execution of queued jobs until [`SimEngine::resume`].
    pub fn pause(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.paused = true;
        }
    }

    pub fn resume(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.paused = false;
        }
        self.shared.changed.notify_all();
    }

    pub fn stats(&self) -> SimStats {
        self.shared.lock().map(|s| s.stats).unwrap_or_default()
    }

    pub fn queue_stats(&self) -> JobQueueStats {
        self.jobs.stats()
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.resume();
        let _ = self.jobs.send(SimTask::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl TaskQueue for SimEngine {
    fn create_task(&self, kind: TaskKind) -> Result<TaskHandle> {
        let task = TaskHandle(self.next_task.fetch_add(1, Ordering::Relaxed));
        debug!(?kind, task = task.0, "sim task created");
        Ok(task)
    }

    fn submit(&self, task: TaskHandle, submission: Submission, immediate: bool) -> Result<Fence> {
        if submission.is_empty() {
            return Err(OrchestrationError::Collaborator(
                "empty submission".to_string(),
            ));
        }
        let fence = Fence(self.next_fence.fetch_add(1, Ordering::Relaxed));
        debug!(
            task = task.0,
            %fence,
            immediate,
            pipes = submission.pipes.len(),
            dwords = submission.total_dwords(),
            "sim submission queued"
        );
        self.jobs.try_send(SimTask::Job { fence, submission })?;
        Ok(fence)
    }

    fn is_signaled(&self, fence: Fence) -> bool {
        self.shared
            .lock()
            .map(|s| s.completed >= fence.0)
            .unwrap_or(false)
    }

    fn wait(&self, fence: Fence, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock()?;
        while state.completed < fence.0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(state, remaining)
                .map_err(|_| OrchestrationError::Collaborator("sim engine poisoned".to_string()))?;
            state = guard;
        }
        Ok(true)
    }

    fn firmware_status(&self) -> FirmwareStatus {
        self.options.firmware
    }
}

fn run_engine(executor: Executor, rx: JobQueueRx<SimTask>, shared: Arc<Shared>) {
    while let Some(task) = rx.recv() {
        match task {
            SimTask::Shutdown => break,
            SimTask::Job { fence, submission } => {
                if !wait_unpaused(&shared) {
                    break;
                }
                let mut stats = SimStats {
                    jobs: 1,
                    ..SimStats::default()
                };
                if let Err(err) = executor.execute(&submission, &mut stats) {
                    warn!(%fence, %err, "sim job faulted");
                    stats.hangs += 1;
                }
                let Ok(mut state) = shared.lock() else {
                    break;
                };
                state.completed = state.completed.max(fence.0);
                accumulate(&mut state.stats, &stats);
                drop(state);
                shared.changed.notify_all();
            }
        }
    }
}

fn wait_unpaused(shared: &Shared) -> bool {
    let Ok(mut state) = shared.lock() else {
        return false;
    };
    while state.paused {
        match shared.changed.wait(state) {
            Ok(guard) => state = guard,
            Err(_) => return false,
        }
    }
    true
}

fn accumulate(total: &mut SimStats, job: &SimStats) {
    total.jobs += job.jobs;
    total.commands += job.commands;
    total.huc_runs += job.huc_runs;
    total.batch_ends_taken += job.batch_ends_taken;
    total.eos_markers += job.eos_markers;
    total.hangs += job.hangs;
}

#[derive(Debug, Default)]
struct HucStage {
    firmware: Option<HucFirmware>,
    dmem: Option<GpuAddress>,
    regions: Vec<(u8, GpuAddress)>,
}

impl HucStage {
    fn region(&self, index: u8) -> Result<GpuAddress> {
        self.regions
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, addr)| *addr)
            .ok_or_else(|| {
                OrchestrationError::Collaborator(format!("huc region {index} not mapped"))
            })
    }
}

#[derive(Debug, Default)]
struct PipeState {
    pc: usize,
    done: bool,
    frame_bytes: u32,
    frame_sse: u32,
    tile_bytes: u32,
    tile_sse: u32,
    qp: u32,
    image_status_ctrl: u32,
    huc_status: u32,
    huc_status2: u32,
    gpr0: u32,
    huc: HucStage,
}

impl PipeState {
    fn register(&self, register: Register) -> u32 {
        match register {
            Register::HucStatus => self.huc_status,
            Register::HucStatus2 => self.huc_status2,
            Register::HcpFrameBytes => self.frame_bytes,
            Register::HcpTileBytes => self.tile_bytes,
            Register::HcpImageStatusCtrl => self.image_status_ctrl,
            Register::HcpQp => self.qp,
            Register::HcpFrameSse => self.frame_sse,
            Register::HcpTileSse => self.tile_sse,
            Register::Gpr0 => self.gpr0,
        }
    }

    fn set_register(&mut self, register: Register, value: u32) {
        match register {
            Register::HucStatus => self.huc_status = value,
            Register::HucStatus2 => self.huc_status2 = value,
            Register::HcpFrameBytes => self.frame_bytes = value,
            Register::HcpTileBytes => self.tile_bytes = value,
            Register::HcpImageStatusCtrl => self.image_status_ctrl = value,
            Register::HcpQp => self.qp = value,
            Register::HcpFrameSse => self.frame_sse = value,
            Register::HcpTileSse => self.tile_sse = value,
            Register::Gpr0 => self.gpr0 = value,
        }
    }
}

enum Step {
    Next,
    Blocked,
    End,
}

struct Executor {
    memory: Arc<HostMemory>,
    authenticated: bool,
    settings: PlatformSettings,
}

impl Executor {
    fn execute(&self, submission: &Submission, stats: &mut SimStats) -> Result<()> {
        let mut pipes: Vec<PipeState> = submission.pipes.iter().map(|_| PipeState::default()).collect();
        let mut lock_owner: Option<usize> = None;

        loop {
            let mut progressed = false;
            for (index, cb) in submission.pipes.iter().enumerate() {
                let pipe = &mut pipes[index];
                if pipe.done {
                    continue;
                }
                let Some(cmd) = cb.ops().get(pipe.pc) else {
                    pipe.done = true;
                    progressed = true;
                    continue;
                };
                match self.step(index, pipe, cmd, &mut lock_owner, stats)? {
                    Step::Next => {
                        pipe.pc += 1;
                        stats.commands += 1;
                        progressed = true;
                    }
                    Step::End => {
                        pipe.done = true;
                        stats.commands += 1;
                        progressed = true;
                    }
                    Step::Blocked => {}
                }
            }
            if pipes.iter().all(|p| p.done) {
                break;
            }
            if !progressed {
                let stuck: Vec<_> = pipes
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| !p.done)
                    .map(|(i, p)| (i, p.pc))
                    .collect();
                warn!(?stuck, "engine hang, skipping frame epilogue");
                stats.hangs += 1;
                return Ok(());
            }
        }

        for (index, cb) in submission.pipes.iter().enumerate() {
            for cmd in cb.epilogue() {
                self.step(index, &mut pipes[index], cmd, &mut lock_owner, stats)?;
                stats.commands += 1;
            }
        }
        Ok(())
    }

    fn step(
        &self,
        index: usize,
        pipe: &mut PipeState,
        cmd: &HwCommand,
        lock_owner: &mut Option<usize>,
        stats: &mut SimStats,
    ) -> Result<Step> {
        let mem = &self.memory;
        match cmd {
            HwCommand::PipeModeSelect { .. } => {
                pipe.frame_bytes = 0;
                pipe.frame_sse = 0;
            }
            HwCommand::HcpPicState { qp } => pipe.qp = u32::from(*qp),
            HwCommand::BatchBufferStart { second_level } => {
                let qp = mem.read_u32(*second_level)?;
                if qp != 0 {
                    pipe.qp = qp;
                }
            }
            HwCommand::TileCoding(_) => {
                pipe.tile_bytes = 0;
                pipe.tile_sse = 0;
            }
            HwCommand::VdencWalker { lcus } => {
                let scale = 2f64.powf((26.0 - f64::from(pipe.qp)) / 6.0);
                let bytes = (f64::from(*lcus) * LCU_BYTES_AT_QP26 * scale).round() as u32;
                let sse = lcus.saturating_mul(pipe.qp * pipe.qp);
                pipe.frame_bytes = pipe.frame_bytes.saturating_add(bytes);
                pipe.tile_bytes = pipe.tile_bytes.saturating_add(bytes);
                pipe.frame_sse = pipe.frame_sse.saturating_add(sse);
                pipe.tile_sse = pipe.tile_sse.saturating_add(sse);
            }
            HwCommand::HucImem { firmware } => {
                pipe.huc.firmware = Some(*firmware);
                pipe.huc_status2 = if self.authenticated {
                    self.settings.huc_auth_ok_mask
                } else {
                    0
                };
            }
            HwCommand::HucDmem { source, .. } => pipe.huc.dmem = Some(*source),
            HwCommand::HucVirtualAddr { regions } => pipe.huc.regions = regions.clone(),
            HwCommand::HucStart { .. } => {
                let stage = std::mem::take(&mut pipe.huc);
                if self.authenticated {
                    stats.huc_runs += 1;
                    pipe.huc_status = self.run_firmware(&stage)?;
                } else {
                    pipe.huc_status = 0;
                }
            }
            HwCommand::MiFlush {
                post_sync: Some((addr, value)),
            } => mem.write_u32(*addr, *value)?,
            HwCommand::StoreDataImm { addr, value } => mem.write_u32(*addr, *value)?,
            HwCommand::StoreRegisterMem { register, addr } => {
                mem.write_u32(*addr, pipe.register(*register))?;
            }
            HwCommand::LoadRegisterMem { register, addr } => {
                let value = mem.read_u32(*addr)?;
                pipe.set_register(*register, value);
            }
            HwCommand::Atomic { addr, op, operand } => {
                mem.update_u32(*addr, |v| match op {
                    AtomicOp::Add => v.wrapping_add(*operand),
                    AtomicOp::Sub => v.wrapping_sub(*operand),
                })?;
            }
            HwCommand::SemaphoreWait {
                addr,
                compare,
                value,
            } => {
                if !compare.holds(mem.read_u32(*addr)?, *value) {
                    return Ok(Step::Blocked);
                }
            }
            HwCommand::ConditionalBatchEnd { addr } => {
                if mem.read_u32(*addr)? & mem.read_u32(addr.add(4))? == 0 {
                    stats.batch_ends_taken += 1;
                    return Ok(Step::End);
                }
            }
            HwCommand::HwLock => match *lock_owner {
                Some(owner) if owner != index => return Ok(Step::Blocked),
                _ => *lock_owner = Some(index),
            },
            HwCommand::HwUnlock => {
                if *lock_owner == Some(index) {
                    *lock_owner = None;
                }
            }
            HwCommand::InsertEos(_) => stats.eos_markers += 1,
            HwCommand::BatchBufferEnd => return Ok(Step::End),
            HwCommand::Prolog
            | HwCommand::ForceWakeup
            | HwCommand::SurfaceState
            | HwCommand::PipeBufAddrState
            | HwCommand::IndObjBaseAddrState
            | HwCommand::VdencPicState { .. }
            | HwCommand::SliceState { .. }
            | HwCommand::VdPipelineFlush
            | HwCommand::VdControlFlush
            | HwCommand::MiFlush { post_sync: None } => {}
        }
        Ok(Step::Next)
    }

    /// Returns the HuC status register value after the run.
    fn run_firmware(&self, stage: &HucStage) -> Result<u32> {
        let dmem = stage.dmem.ok_or_else(|| {
            OrchestrationError::Collaborator("huc started without dmem".to_string())
        })?;
        let word = |i: usize| self.memory.read_u32(dmem.add(i as u32 * 4));
        match stage.firmware {
            Some(HucFirmware::BrcInit) => {
                let hist = stage.region(0)?;
                let put = |i: usize, v: u32| self.memory.write_u32(hist.add(i as u32 * 4), v);
                put(history::INITIALIZED, 1)?;
                put(history::QP_IP, word(init_dmem::INIT_QP_IP)?)?;
                put(history::QP_B, word(init_dmem::INIT_QP_B)?)?;
                put(history::MIN_QP, word(init_dmem::MIN_QP)?)?;
                put(history::MAX_QP, word(init_dmem::MAX_QP)?)?;
                put(history::BRC_FLAG, word(init_dmem::BRC_FLAG)?)?;
                put(history::ACQP, word(init_dmem::ACQP)?)?;
                put(history::FRAMES, 0)?;
                Ok(0)
            }
            Some(HucFirmware::BrcUpdate) => self.brc_update(stage, &word),
            Some(HucFirmware::PakIntegrate) => {
                let tiles = word(0)?;
                let tile_stats = stage.region(0)?;
                let frame = stage.region(1)?;
                let (mut bytes, mut sse) = (0u32, 0u32);
                for tile in 0..tiles {
                    let at = tile_stats.add(tile * TILE_STATS_BYTES);
                    bytes = bytes.saturating_add(self.memory.read_u32(at)?);
                    sse = sse.saturating_add(self.memory.read_u32(at.add(4))?);
                }
                self.memory.write_u32(frame, bytes)?;
                self.memory.write_u32(frame.add(4), sse)?;
                Ok(0)
            }
            None => Err(OrchestrationError::Collaborator(
                "huc started without firmware".to_string(),
            )),
        }
    }

    fn brc_update(&self, stage: &HucStage, word: &dyn Fn(usize) -> Result<u32>) -> Result<u32> {
        let hist = stage.region(0)?;
        let pass_stats = stage.region(1)?;
        let slbb = stage.region(2)?;
        let get = |i: usize| self.memory.read_u32(hist.add(i as u32 * 4));
        if get(history::INITIALIZED)? == 0 {
            return Ok(0);
        }

        let pass = word(update_dmem::PASS)?;
        let target = word(update_dmem::TARGET_FRAME_BYTES)?.max(1);
        let qp_slot = if word(update_dmem::PICTURE_TYPE)? == 3 {
            history::QP_B
        } else {
            history::QP_IP
        };
        let (min_qp, max_qp) = (get(history::MIN_QP)?, get(history::MAX_QP)?);
        let acqp = get(history::ACQP)?;
        let mut qp = get(qp_slot)?;
        let mut reencode = false;

        if pass == 0 {
            self.memory
                .update_u32(hist.add(history::FRAMES as u32 * 4), |v| v.wrapping_add(1))?;
        }
        if get(history::BRC_FLAG)? == BRC_FLAG_ICQ && acqp != 0 {
            qp = acqp;
        } else if pass > 0 {
            let produced = self
                .memory
                .read_u32(pass_stats.add((pass - 1) * PASS_STATS_BYTES))?;
            let ratio = f64::from(produced.max(1)) / f64::from(target);
            if (ratio - 1.0).abs() > SIZE_TOLERANCE {
                let delta = (6.0 * ratio.log2()).round() as i64;
                let adjusted = (i64::from(qp) + delta).clamp(i64::from(min_qp), i64::from(max_qp)) as u32;
                reencode = adjusted != qp;
                qp = adjusted;
            }
        }
        self.memory.write_u32(hist.add(qp_slot as u32 * 4), qp)?;
        self.memory.write_u32(slbb, qp)?;
        Ok(if pass == 0 || reencode {
            self.settings.huc_reencode_mask
        } else {
            0
        })
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub task: TaskHandle,
    pub fence: Fence,
    pub immediate: bool,
    pub submission: Submission,
}

/// Task queue that keeps every submission for inspection and executes
/// nothing. Fences signal only through [`RecordingQueue::retire_all`].
#[derive(Debug)]
pub struct RecordingQueue {
    firmware: FirmwareStatus,
    submissions: Mutex<Vec<RecordedSubmission>>,
    retired: AtomicU64,
    next_fence: AtomicU64,
}

impl Default for RecordingQueue {
    fn default() -> Self {
        Self::new(FirmwareStatus::Authenticated)
    }
}

impl RecordingQueue {
    pub fn new(firmware: FirmwareStatus) -> Self {
        Self {
            firmware,
            submissions: Mutex::new(Vec::new()),
            retired: AtomicU64::new(0),
            next_fence: AtomicU64::new(1),
        }
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.submissions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals every fence handed out so far.
    pub fn retire_all(&self) {
        let last = self.next_fence.load(Ordering::Relaxed).saturating_sub(1);
        self.retired.fetch_max(last, Ordering::Relaxed);
    }
}

impl TaskQueue for RecordingQueue {
    fn create_task(&self, _kind: TaskKind) -> Result<TaskHandle> {
        Ok(TaskHandle(1))
    }

    fn submit(&self, task: TaskHandle, submission: Submission, immediate: bool) -> Result<Fence> {
        let fence = Fence(self.next_fence.fetch_add(1, Ordering::Relaxed));
        self.submissions
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("recording queue poisoned".to_string()))?
            .push(RecordedSubmission {
                task,
                fence,
                immediate,
                submission,
            });
        Ok(fence)
    }

    fn is_signaled(&self, fence: Fence) -> bool {
        self.retired.load(Ordering::Relaxed) >= fence.0
    }

    fn wait(&self, fence: Fence, _timeout: Duration) -> Result<bool> {
        Ok(self.is_signaled(fence))
    }

    fn firmware_status(&self) -> FirmwareStatus {
        self.firmware
    }
}

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::contract::{
    Dimensions, EncodeFrame, FeatureConfig, MAX_QP, OrchestrationError, PictureType,
    RateControlMode, Result, SequenceParams,
};
use crate::platform::PlatformSettings;
use crate::resource::{GpuAddress, MemoryServices, ResourceHandle, ResourceSpec};

const CONVERGENCE_HISTORY: usize = 64;
pub const HISTORY_BYTES: usize = 64;

/// Word indices of the BRC init DMEM.
pub mod init_dmem {
    pub const BRC_FLAG: usize = 0;
    pub const TARGET_BPS: usize = 1;
    pub const MAX_BPS: usize = 2;
    pub const VBV_BITS: usize = 3;
    pub const INIT_FULLNESS_BITS: usize = 4;
    pub const MIN_QP: usize = 5;
    pub const MAX_QP: usize = 6;
    pub const GOP_LENGTH: usize = 7;
    pub const FRAME_RATE_NUM: usize = 8;
    pub const FRAME_RATE_DEN: usize = 9;
    pub const INIT_QP_IP: usize = 10;
    pub const INIT_QP_B: usize = 11;
    pub const ACQP: usize = 12;
    pub const WIDTH: usize = 13;
    pub const HEIGHT: usize = 14;
    pub const WORDS: usize = 15;
}

/// Word indices of the per-pass BRC update DMEM.
pub mod update_dmem {
    pub const TARGET_FRAME_BYTES: usize = 0;
    pub const PASS: usize = 1;
    pub const MAX_PASSES: usize = 2;
    pub const PICTURE_TYPE: usize = 3;
    pub const FRAME_NUMBER: usize = 4;
    pub const ROI_COUNT: usize = 5;
    pub const STREAM_IN: usize = 6;
    pub const WORDS: usize = 7;
}

/// Word indices of the firmware-owned BRC history buffer.
pub mod history {
    pub const INITIALIZED: usize = 0;
    pub const QP_IP: usize = 1;
    pub const QP_B: usize = 2;
    pub const MIN_QP: usize = 3;
    pub const MAX_QP: usize = 4;
    pub const BRC_FLAG: usize = 5;
    pub const ACQP: usize = 6;
    pub const FRAMES: usize = 7;
}

pub const BRC_FLAG_ICQ: u32 = 0;
pub const BRC_FLAG_CBR: u32 = 1;
pub const BRC_FLAG_VBR: u32 = 2;
pub const BRC_FLAG_LOW_DELAY: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrcInitParams {
    pub brc_flag: u32,
    pub target_bps: u32,
    pub max_bps: u32,
    pub vbv_bits: u32,
    pub init_fullness_bits: u32,
    pub min_qp: u8,
    pub max_qp: u8,
    pub gop_length: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub init_qp_ip: u8,
    pub init_qp_b: u8,
    pub acqp: u32,
    pub width: u32,
    pub height: u32,
}

impl BrcInitParams {
    pub fn new(mode: RateControlMode, seq: &SequenceParams) -> Self {
        let (mut brc_flag, acqp) = match mode {
            RateControlMode::Icq => (BRC_FLAG_ICQ, u32::from(seq.icq_quality_factor)),
            RateControlMode::Cbr => (BRC_FLAG_CBR, 0),
            RateControlMode::Vbr => (BRC_FLAG_VBR, 0),
            RateControlMode::Qvbr => (BRC_FLAG_VBR, u32::from(seq.icq_quality_factor)),
            RateControlMode::Cqp => (BRC_FLAG_ICQ, 0),
        };
        if seq.low_delay {
            brc_flag = BRC_FLAG_LOW_DELAY;
        }
        let (init_qp_ip, init_qp_b) = initial_qp(seq);
        Self {
            brc_flag,
            target_bps: seq.target_bitrate_kbps.saturating_mul(1000),
            max_bps: seq.max_bitrate_kbps.saturating_mul(1000),
            vbv_bits: seq.vbv_buffer_size_bits,
            init_fullness_bits: seq.init_vbv_fullness_bits.min(seq.vbv_buffer_size_bits),
            min_qp: seq.min_qp,
            max_qp: seq.max_qp,
            gop_length: seq.gop_length,
            frame_rate_num: seq.frame_rate_num,
            frame_rate_den: seq.frame_rate_den,
            init_qp_ip,
            init_qp_b,
            acqp,
            width: seq.dims.width.get(),
            height: seq.dims.height.get(),
        }
    }

    pub fn to_dmem(&self) -> [u32; init_dmem::WORDS] {
        let mut words = [0u32; init_dmem::WORDS];
        words[init_dmem::BRC_FLAG] = self.brc_flag;
        words[init_dmem::TARGET_BPS] = self.target_bps;
        words[init_dmem::MAX_BPS] = self.max_bps;
        words[init_dmem::VBV_BITS] = self.vbv_bits;
        words[init_dmem::INIT_FULLNESS_BITS] = self.init_fullness_bits;
        words[init_dmem::MIN_QP] = u32::from(self.min_qp);
        words[init_dmem::MAX_QP] = u32::from(self.max_qp);
        words[init_dmem::GOP_LENGTH] = self.gop_length;
        words[init_dmem::FRAME_RATE_NUM] = self.frame_rate_num;
        words[init_dmem::FRAME_RATE_DEN] = self.frame_rate_den;
        words[init_dmem::INIT_QP_IP] = u32::from(self.init_qp_ip);
        words[init_dmem::INIT_QP_B] = u32::from(self.init_qp_b);
        words[init_dmem::ACQP] = self.acqp;
        words[init_dmem::WIDTH] = self.width;
        words[init_dmem::HEIGHT] = self.height;
        words
    }
}

/// Starting QPs derived from bits per pixel and GOP length.
pub fn initial_qp(seq: &SequenceParams) -> (u8, u8) {
    const X0: f64 = 0.0;
    const Y0: f64 = 1.19;
    const X1: f64 = 1.75;
    const Y1: f64 = 1.75;

    let min = i32::from(seq.min_qp);
    let max = i32::from(seq.max_qp.max(seq.min_qp));
    let frame_size =
        f64::from(seq.dims.width.get()) * f64::from(seq.dims.height.get()) * 3.0 / 2.0;
    let fps = f64::from(seq.frame_rate_num.max(1)) / f64::from(seq.frame_rate_den.max(1));
    let bps = f64::from(seq.target_bitrate_kbps.max(1)) * 1000.0;
    let x = (frame_size * 2.0 / 3.0 * fps / bps).log10();
    let mut qp_ip = (1.0 / 1.2 * 10f64.powf((x - X0) * (Y1 - Y0) / (X1 - X0) + Y0) + 0.5) as i32;
    qp_ip += 2;

    let gop = seq.gop_length.max(1) as i32;
    if gop == 1 {
        qp_ip += 12;
    } else if gop < 15 {
        qp_ip += (14 - gop) >> 1;
    }
    qp_ip = qp_ip.clamp(min, max) - 1;
    if qp_ip < 0 {
        qp_ip = 1;
    }
    let mut qp_b = (((qp_ip + qp_ip) * 563) >> 10) + 1;
    qp_b = qp_b.clamp(min, max);
    let drop = if gop > 300 { 8 } else { 2 };
    qp_ip = (qp_ip - drop).clamp(min, max);
    qp_b = (qp_b - drop).clamp(min, max);
    (qp_ip as u8, qp_b as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrcUpdateParams {
    pub target_frame_bytes: u32,
    pub pass: u8,
    pub max_passes: u8,
    pub picture_type: PictureType,
    pub frame_number: u32,
    pub roi_count: u8,
    pub stream_in: bool,
}

impl BrcUpdateParams {
    pub fn to_dmem(&self) -> [u32; update_dmem::WORDS] {
        let mut words = [0u32; update_dmem::WORDS];
        words[update_dmem::TARGET_FRAME_BYTES] = self.target_frame_bytes;
        words[update_dmem::PASS] = u32::from(self.pass);
        words[update_dmem::MAX_PASSES] = u32::from(self.max_passes);
        words[update_dmem::PICTURE_TYPE] = self.picture_type.as_u32();
        words[update_dmem::FRAME_NUMBER] = self.frame_number;
        words[update_dmem::ROI_COUNT] = u32::from(self.roi_count);
        words[update_dmem::STREAM_IN] = u32::from(self.stream_in);
        words
    }
}

/// Per-frame rate-control decision. Pure function of the feature state and
/// the frame; nothing changes until `BrcFeature::commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrcDecision {
    pub mode: RateControlMode,
    pub firmware: bool,
    pub init_required: bool,
    pub reset_ignored: bool,
    pub num_passes: u8,
    pub init: Option<BrcInitParams>,
    pub target_frame_bytes: u32,
}

#[derive(Debug)]
pub struct BrcFeature {
    mode: RateControlMode,
    max_passes: u8,
    platform_max_passes: u8,
    history: ResourceHandle,
    initialized: bool,
    last_dims: Option<Dimensions>,
    last_mode: Option<RateControlMode>,
    convergence: VecDeque<u8>,
}

impl BrcFeature {
    pub fn new(
        config: &FeatureConfig,
        settings: &PlatformSettings,
        memory: &dyn MemoryServices,
    ) -> Result<Self> {
        let history = memory.allocate(&ResourceSpec::new("brc_history", HISTORY_BYTES))?;
        Ok(Self {
            mode: config.rate_control_mode,
            max_passes: config.max_brc_passes,
            platform_max_passes: settings.max_brc_passes,
            history,
            initialized: false,
            last_dims: None,
            last_mode: None,
            convergence: VecDeque::with_capacity(CONVERGENCE_HISTORY),
        })
    }

    pub fn reconfigure(&mut self, config: &FeatureConfig) {
        self.mode = config.rate_control_mode;
        self.max_passes = config.max_brc_passes;
    }

    pub fn mode(&self) -> RateControlMode {
        self.mode
    }

    pub fn num_passes(&self) -> u8 {
        if self.mode.is_bitrate_controlled() {
            self.max_passes.min(self.platform_max_passes).max(1)
        } else {
            1
        }
    }

    pub fn history_address(&self) -> GpuAddress {
        GpuAddress::new(self.history, 0)
    }

    pub fn validate(&self, frame: &EncodeFrame) -> Result<()> {
        let seq = &frame.sequence;
        if seq.min_qp > seq.max_qp || seq.max_qp > MAX_QP {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "qp range {}..={} invalid",
                seq.min_qp, seq.max_qp
            )));
        }
        match self.mode {
            RateControlMode::Cqp if frame.qp > MAX_QP => {
                Err(OrchestrationError::InvalidConfiguration(format!(
                    "frame qp {} above {MAX_QP}",
                    frame.qp
                )))
            }
            RateControlMode::Icq if !(1..=MAX_QP).contains(&seq.icq_quality_factor) => {
                Err(OrchestrationError::InvalidConfiguration(format!(
                    "icq quality factor {} outside 1..={MAX_QP}",
                    seq.icq_quality_factor
                )))
            }
            mode if mode.is_bitrate_controlled() && seq.vbv_buffer_size_bits == 0 => {
                Err(OrchestrationError::InvalidConfiguration(format!(
                    "{mode} needs a non-zero vbv buffer"
                )))
            }
            mode if mode.is_bitrate_controlled() && seq.target_bitrate_kbps == 0 => {
                Err(OrchestrationError::InvalidConfiguration(format!(
                    "{mode} needs a non-zero target bitrate"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, frame: &EncodeFrame) -> Result<BrcDecision> {
        self.validate(frame)?;
        let firmware = self.mode.uses_firmware();
        let reset_ignored = frame.brc_reset && !self.mode.accepts_reset();
        let init_required = firmware
            && (!self.initialized
                || (frame.brc_reset && self.mode.accepts_reset())
                || self.last_dims != Some(frame.sequence.dims)
                || self.last_mode != Some(self.mode));
        let target_bits = frame.sequence.target_frame_bits();
        Ok(BrcDecision {
            mode: self.mode,
            firmware,
            init_required,
            reset_ignored,
            num_passes: self.num_passes(),
            init: init_required.then(|| BrcInitParams::new(self.mode, &frame.sequence)),
            target_frame_bytes: u32::try_from(target_bits / 8).unwrap_or(u32::MAX),
        })
    }

    pub fn commit(&mut self, frame: &EncodeFrame, decision: &BrcDecision) {
        if decision.reset_ignored {
            warn!(seq = %frame.seq, mode = %decision.mode, "brc reset ignored for this rate control mode");
        }
        if decision.init_required {
            debug!(seq = %frame.seq, mode = %decision.mode, "brc init scheduled");
        }
        if decision.firmware {
            self.initialized = true;
            self.last_dims = Some(frame.sequence.dims);
            self.last_mode = Some(decision.mode);
        }
    }

    pub fn record_convergence(&mut self, passes: u8) {
        if self.convergence.len() == CONVERGENCE_HISTORY {
            self.convergence.pop_front();
        }
        self.convergence.push_back(passes);
    }

    /// Passes actually executed by recent frames, oldest first.
    pub fn convergence_history(&self) -> impl Iterator<Item = u8> + '_ {
        self.convergence.iter().copied()
    }
}

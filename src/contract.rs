use std::num::NonZeroU32;
use std::time::Duration;
use std::{fmt, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::command::CommandBuffer;

pub const MAX_QP: u8 = 51;
pub const MAX_ROI_REGIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameSeq(pub u32);

impl FrameSeq {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Wrapping comparison against a hardware-reported sequence number.
    pub fn is_reached_by(self, reported: u32) -> bool {
        reported.wrapping_sub(self.0) < u32::MAX / 2
    }
}

impl Display for FrameSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    pub fn width_in_lcu(&self, lcu_size: u32) -> u32 {
        self.width.get().div_ceil(lcu_size.max(1))
    }

    pub fn height_in_lcu(&self, lcu_size: u32) -> u32 {
        self.height.get().div_ceil(lcu_size.max(1))
    }

    /// `None` when the picture holds more LCUs than a u32 can count.
    pub fn lcu_count(&self, lcu_size: u32) -> Option<u32> {
        self.width_in_lcu(lcu_size)
            .checked_mul(self.height_in_lcu(lcu_size))
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PictureType {
    I,
    P,
    B,
}

impl PictureType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::I => 1,
            Self::P => 2,
            Self::B => 3,
        }
    }
}

impl Display for PictureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I => f.write_str("I"),
            Self::P => f.write_str("P"),
            Self::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    #[default]
    Cqp,
    Cbr,
    Vbr,
    Icq,
    Qvbr,
}

impl RateControlMode {
    /// Modes that chase a target bitrate and may re-encode.
    pub fn is_bitrate_controlled(self) -> bool {
        matches!(self, Self::Cbr | Self::Vbr | Self::Qvbr)
    }

    /// Modes that run the BRC firmware at all.
    pub fn uses_firmware(self) -> bool {
        !matches!(self, Self::Cqp)
    }

    pub fn accepts_reset(self) -> bool {
        self.is_bitrate_controlled()
    }
}

impl Display for RateControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cqp => f.write_str("cqp"),
            Self::Cbr => f.write_str("cbr"),
            Self::Vbr => f.write_str("vbr"),
            Self::Icq => f.write_str("icq"),
            Self::Qvbr => f.write_str("qvbr"),
        }
    }
}

/// Sequence-level coding parameters, immutable for the duration of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceParams {
    pub dims: Dimensions,
    pub lcu_size: u32,
    pub target_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub vbv_buffer_size_bits: u32,
    pub init_vbv_fullness_bits: u32,
    pub min_qp: u8,
    pub max_qp: u8,
    pub gop_length: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub icq_quality_factor: u8,
    pub low_delay: bool,
}

impl SequenceParams {
    #[must_use]
    pub fn for_dims(dims: Dimensions) -> Self {
        Self {
            dims,
            lcu_size: 64,
            target_bitrate_kbps: 4_000,
            max_bitrate_kbps: 6_000,
            vbv_buffer_size_bits: 4_000_000,
            init_vbv_fullness_bits: 2_000_000,
            min_qp: 10,
            max_qp: MAX_QP,
            gop_length: 30,
            frame_rate_num: 30,
            frame_rate_den: 1,
            icq_quality_factor: 26,
            low_delay: false,
        }
    }

    pub fn width_in_lcu(&self) -> u32 {
        self.dims.width_in_lcu(self.lcu_size)
    }

    pub fn height_in_lcu(&self) -> u32 {
        self.dims.height_in_lcu(self.lcu_size)
    }

    pub fn lcu_count(&self) -> Result<u32> {
        self.dims.lcu_count(self.lcu_size).ok_or_else(|| {
            OrchestrationError::InvalidConfiguration(format!(
                "{} at lcu size {} has too many lcus",
                self.dims, self.lcu_size
            ))
        })
    }

    /// Average bits available per frame at the target rate.
    pub fn target_frame_bits(&self) -> u64 {
        let num = u64::from(self.frame_rate_num.max(1));
        let den = u64::from(self.frame_rate_den.max(1));
        u64::from(self.target_bitrate_kbps) * 1000 * den / num
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceParams {
    pub start_lcu: u32,
    pub num_lcus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeFrame {
    pub seq: FrameSeq,
    pub picture_type: PictureType,
    pub sequence: SequenceParams,
    pub slices: Vec<SliceParams>,
    pub qp: u8,
    pub brc_reset: bool,
    pub last_pic_in_seq: bool,
    pub last_pic_in_stream: bool,
}

impl EncodeFrame {
    /// One slice covering the whole picture. Oversized pictures get an empty
    /// slice list and are rejected when the frame is evaluated.
    #[must_use]
    pub fn new(seq: FrameSeq, picture_type: PictureType, sequence: SequenceParams) -> Self {
        let slices = match sequence.lcu_count() {
            Ok(num_lcus) => vec![SliceParams {
                start_lcu: 0,
                num_lcus,
            }],
            Err(_) => Vec::new(),
        };
        Self {
            seq,
            picture_type,
            sequence,
            slices,
            qp: 26,
            brc_reset: false,
            last_pic_in_seq: false,
            last_pic_in_stream: false,
        }
    }

    pub fn with_slices(mut self, slices: Vec<SliceParams>) -> Self {
        self.slices = slices;
        self
    }
}

impl Display for EncodeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodeFrame(seq={}, type={}, dims={}, slices={})",
            self.seq,
            self.picture_type,
            self.sequence.dims,
            self.slices.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayout {
    pub column_widths_lcu: Vec<u32>,
    pub row_heights_lcu: Vec<u32>,
}

impl TileLayout {
    /// Splits the frame into `columns` x `rows` tiles of near-equal LCU size.
    pub fn uniform(sequence: &SequenceParams, columns: u32, rows: u32) -> Self {
        Self {
            column_widths_lcu: split_even(sequence.width_in_lcu(), columns),
            row_heights_lcu: split_even(sequence.height_in_lcu(), rows),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.column_widths_lcu.len()
    }

    pub fn num_rows(&self) -> usize {
        self.row_heights_lcu.len()
    }

    /// One slice per tile, addressed in tile-scan order.
    pub fn slices(&self) -> Result<Vec<SliceParams>> {
        let overflow = || {
            OrchestrationError::InvalidConfiguration(format!(
                "{}x{} tile layout has too many lcus",
                self.num_columns(),
                self.num_rows()
            ))
        };
        let mut start_lcu = 0u32;
        let mut slices = Vec::with_capacity(self.num_columns() * self.num_rows());
        for height in &self.row_heights_lcu {
            for width in &self.column_widths_lcu {
                let num_lcus = width.checked_mul(*height).ok_or_else(overflow)?;
                slices.push(SliceParams {
                    start_lcu,
                    num_lcus,
                });
                start_lcu = start_lcu.checked_add(num_lcus).ok_or_else(overflow)?;
            }
        }
        Ok(slices)
    }
}

fn split_even(total: u32, parts: u32) -> Vec<u32> {
    let parts = parts.clamp(1, total.max(1));
    (0..parts)
        .map(|i| (i + 1) * total / parts - i * total / parts)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiRegion {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub priority: i8,
}

/// Per-frame feature selection. Immutable once a frame starts activating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub rate_control_mode: RateControlMode,
    pub tiling_enabled: bool,
    pub tile_layout: Option<TileLayout>,
    pub lookahead_depth: u32,
    pub lookahead_adaptive_intra: bool,
    pub max_adaptive_gop: u32,
    pub max_brc_passes: u8,
    pub roi_regions: Vec<RoiRegion>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rate_control_mode: RateControlMode::Cqp,
            tiling_enabled: false,
            tile_layout: None,
            lookahead_depth: 0,
            lookahead_adaptive_intra: false,
            max_adaptive_gop: 0,
            max_brc_passes: 2,
            roi_regions: Vec::new(),
        }
    }
}

impl Display for FeatureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FeatureConfig(rc={}, tiling={}, lookahead={}, max_brc_passes={}, roi={})",
            self.rate_control_mode,
            self.tiling_enabled,
            self.lookahead_depth,
            self.max_brc_passes,
            self.roi_regions.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("null dependency: {0}")]
    NullDependency(String),
    #[error("hardware rejected: {0}")]
    HardwareRejected(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl OrchestrationError {
    /// Only backpressure is worth retrying with the same frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    VdboxEncode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fence(pub u64);

impl Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fence#{}", self.0)
    }
}

/// One GPU job: a command buffer per hardware pipe, indexed by pipe.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub pipes: Vec<CommandBuffer>,
}

impl Submission {
    pub fn with_pipes(num_pipes: usize, capacity_dwords: usize) -> Self {
        Self {
            pipes: (0..num_pipes.max(1))
                .map(|_| CommandBuffer::with_capacity(capacity_dwords))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.iter().all(CommandBuffer::is_empty)
    }

    pub fn total_dwords(&self) -> usize {
        self.pipes.iter().map(CommandBuffer::used_dwords).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Authenticated,
    LoadFailed,
    AuthenticationFailed,
}

/// Command-queue collaborator. Opaque to the orchestration layer apart from
/// what gets submitted and when.
pub trait TaskQueue: Send + Sync {
    fn create_task(&self, kind: TaskKind) -> Result<TaskHandle>;

    fn submit(&self, task: TaskHandle, submission: Submission, immediate: bool) -> Result<Fence>;

    fn is_signaled(&self, fence: Fence) -> bool;

    fn wait(&self, fence: Fence, timeout: Duration) -> Result<bool>;

    fn firmware_status(&self) -> FirmwareStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_seq_reached_handles_wraparound() {
        assert!(FrameSeq(5).is_reached_by(5));
        assert!(FrameSeq(5).is_reached_by(9));
        assert!(!FrameSeq(5).is_reached_by(4));
        assert!(FrameSeq(u32::MAX).is_reached_by(1));
    }

    #[test]
    fn uniform_tile_layout_covers_frame() {
        let seq = SequenceParams::for_dims(Dimensions::new(1920, 1080).unwrap());
        let layout = TileLayout::uniform(&seq, 2, 2);
        assert_eq!(layout.column_widths_lcu.iter().sum::<u32>(), seq.width_in_lcu());
        assert_eq!(layout.row_heights_lcu.iter().sum::<u32>(), seq.height_in_lcu());
        assert_eq!(layout.num_columns(), 2);

        let slices = layout.slices().unwrap();
        assert_eq!(slices.len(), 4);
        assert_eq!(slices.iter().map(|s| s.num_lcus).sum::<u32>(), seq.lcu_count().unwrap());
    }

    #[test]
    fn oversized_pictures_do_not_wrap_lcu_counts() {
        let mut seq = SequenceParams::for_dims(Dimensions::new(u32::MAX, u32::MAX).unwrap());
        seq.lcu_size = 16;
        let err = seq.lcu_count().unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
        assert!(EncodeFrame::new(FrameSeq(0), PictureType::I, seq.clone()).slices.is_empty());

        let layout = TileLayout {
            column_widths_lcu: vec![1 << 16, 1 << 16],
            row_heights_lcu: vec![1 << 15],
        };
        assert!(layout.slices().is_err());
    }

    #[test]
    fn target_frame_bits_follow_frame_rate() {
        let seq = SequenceParams::for_dims(Dimensions::new(640, 360).unwrap());
        assert_eq!(seq.target_frame_bits(), 4_000_000 / 30);
    }

    #[test]
    fn only_backpressure_is_recoverable() {
        assert!(OrchestrationError::ResourceExhausted("ring".into()).is_recoverable());
        assert!(!OrchestrationError::HardwareRejected("huc".into()).is_recoverable());
    }
}

use std::fmt;

use crate::command::{CommandBuffer, HwCommand};
use crate::contract::{EncodeFrame, OrchestrationError, Result};
use crate::feature::FrameFeatures;
use crate::platform::PlatformSettings;
use crate::resource::{GpuAddress, MemoryServices};
use crate::ring::SlotResources;
use crate::scalability::{PipeContext, Scalability};
use crate::status::{ReportHandle, StatusRecord, StatusReportData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKind {
    HucBrcInit,
    HucBrcUpdate,
    VdencPicture,
    PakIntegrate,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HucBrcInit => f.write_str("huc_brc_init"),
            Self::HucBrcUpdate => f.write_str("huc_brc_update"),
            Self::VdencPicture => f.write_str("hevc_vdenc"),
            Self::PakIntegrate => f.write_str("pak_integrate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    BuildsPicture,
    BuildsSlice,
    BuildsTile,
    RunsFirmware,
}

/// One entry of a frame's activation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub packet: PacketKind,
    pub pass: u8,
    pub pipe: u8,
    pub immediate_submit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassContext {
    pub index: u8,
    pub num_passes: u8,
}

impl PassContext {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.num_passes
    }
}

/// Everything a packet may read while building one activation.
pub struct BuildContext<'a> {
    pub frame: &'a EncodeFrame,
    pub features: &'a FrameFeatures,
    pub pass: PassContext,
    pub pipe: PipeContext,
    pub slot: &'a SlotResources,
    pub report: &'a ReportHandle,
    pub scalability: &'a Scalability,
    pub memory: &'a dyn MemoryServices,
    pub settings: &'a PlatformSettings,
    pub brc_history: GpuAddress,
    pub lookahead_stats: Option<GpuAddress>,
    /// No earlier segment of this frame precedes this one in the pipe's buffer.
    pub first_in_phase: bool,
    pub batching: bool,
}

impl BuildContext<'_> {
    pub fn needs_prolog(&self) -> bool {
        !self.batching || self.first_in_phase
    }

    pub fn emit_prolog(&self, cb: &mut CommandBuffer) -> Result<()> {
        if self.needs_prolog() {
            cb.emit(HwCommand::Prolog)?;
            cb.emit(HwCommand::ForceWakeup)?;
        }
        Ok(())
    }

    /// Guards the rest of the batch with the firmware convergence predicate.
    pub fn emit_convergence_end(&self, cb: &mut CommandBuffer) -> Result<()> {
        cb.emit(HwCommand::ConditionalBatchEnd {
            addr: self.slot.convergence(),
        })
    }

    pub fn second_level_batch(&self) -> Result<GpuAddress> {
        self.slot
            .second_level_batch
            .get(usize::from(self.pass.index))
            .map(|h| GpuAddress::new(*h, 0))
            .ok_or_else(|| {
                OrchestrationError::InvalidConfiguration(format!(
                    "no second level batch for pass {}",
                    self.pass.index
                ))
            })
    }
}

pub struct CompletionContext<'a> {
    pub features: &'a FrameFeatures,
    pub num_pipes: u8,
    pub slot: &'a SlotResources,
    pub record: &'a StatusRecord,
    pub memory: &'a dyn MemoryServices,
    pub settings: &'a PlatformSettings,
}

impl CompletionContext<'_> {
    pub fn firmware_authenticated(&self) -> bool {
        self.record.huc_status2 & self.settings.huc_auth_ok_mask != 0
    }
}

/// A unit of command-buffer construction. Packets keep no per-frame state;
/// the controller injects frame, pass, pipe and slot for every activation.
pub trait EncodePacket: Send {
    fn kind(&self) -> PacketKind;

    fn capabilities(&self) -> &'static [Capability];

    fn build(&mut self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()>;

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> Result<()>;

    /// Number of activations built so far.
    fn activations(&self) -> u64;

    fn has(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Whether activating this packet for the frame starts a HuC image, and
    /// so needs authenticated firmware before anything is submitted.
    fn runs_firmware(&self, _features: &FrameFeatures, _num_pipes: u8) -> bool {
        self.has(Capability::RunsFirmware)
    }
}

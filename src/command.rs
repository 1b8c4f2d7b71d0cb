use std::fmt;

use crate::contract::{OrchestrationError, Result};
use crate::resource::GpuAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreCompare {
    Equal,
    NotEqual,
}

impl SemaphoreCompare {
    pub fn holds(self, current: u32, expected: u32) -> bool {
        match self {
            Self::Equal => current == expected,
            Self::NotEqual => current != expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EosKind {
    EndOfSequence,
    EndOfStream,
}

/// MMIO registers the orchestration layer reads back or loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    HucStatus,
    HucStatus2,
    /// Bytes produced since the last pipe mode select.
    HcpFrameBytes,
    /// Bytes produced since the last tile coding command.
    HcpTileBytes,
    HcpImageStatusCtrl,
    HcpQp,
    HcpFrameSse,
    HcpTileSse,
    /// General purpose register used for memory-to-memory copies.
    Gpr0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HucFirmware {
    BrcInit,
    BrcUpdate,
    PakIntegrate,
}

impl fmt::Display for HucFirmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrcInit => f.write_str("brc_init"),
            Self::BrcUpdate => f.write_str("brc_update"),
            Self::PakIntegrate => f.write_str("pak_integrate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoding {
    pub column: u32,
    pub row: u32,
    pub index: u32,
    pub lcu_count: u32,
    pub last_in_row: bool,
    pub last_in_frame: bool,
}

/// One logical hardware operation. Byte layouts belong to the command
/// builders; this layer only decides which operations appear and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCommand {
    Prolog,
    ForceWakeup,
    PipeModeSelect { pipe: u8, num_pipes: u8 },
    SurfaceState,
    PipeBufAddrState,
    IndObjBaseAddrState,
    HcpPicState { qp: u8 },
    VdencPicState { stream_in: bool, roi_regions: u8 },
    SliceState { start_lcu: u32, num_lcus: u32, last: bool },
    TileCoding(TileCoding),
    VdencWalker { lcus: u32 },
    BatchBufferStart { second_level: GpuAddress },
    HucImem { firmware: HucFirmware },
    HucDmem { source: GpuAddress, len: u32 },
    HucVirtualAddr { regions: Vec<(u8, GpuAddress)> },
    HucStart { last_stream_object: bool },
    VdPipelineFlush,
    VdControlFlush,
    MiFlush { post_sync: Option<(GpuAddress, u32)> },
    StoreDataImm { addr: GpuAddress, value: u32 },
    StoreRegisterMem { register: Register, addr: GpuAddress },
    LoadRegisterMem { register: Register, addr: GpuAddress },
    Atomic { addr: GpuAddress, op: AtomicOp, operand: u32 },
    SemaphoreWait { addr: GpuAddress, compare: SemaphoreCompare, value: u32 },
    /// Ends the current batch when `(mem[addr] & mem[addr + 4]) == 0`.
    ConditionalBatchEnd { addr: GpuAddress },
    HwLock,
    HwUnlock,
    InsertEos(EosKind),
    BatchBufferEnd,
}

impl HwCommand {
    pub fn dword_size(&self) -> usize {
        match self {
            Self::Prolog => 10,
            Self::ForceWakeup => 4,
            Self::PipeModeSelect { .. } => 6,
            Self::SurfaceState => 3,
            Self::PipeBufAddrState => 104,
            Self::IndObjBaseAddrState => 29,
            Self::HcpPicState { .. } => 31,
            Self::VdencPicState { .. } => 20,
            Self::SliceState { .. } => 13,
            Self::TileCoding(_) => 5,
            Self::VdencWalker { .. } => 5,
            Self::BatchBufferStart { .. } => 3,
            Self::HucImem { .. } => 4,
            Self::HucDmem { .. } => 6,
            Self::HucVirtualAddr { .. } => 49,
            Self::HucStart { .. } => 2,
            Self::VdPipelineFlush => 2,
            Self::VdControlFlush => 3,
            Self::MiFlush { .. } => 5,
            Self::StoreDataImm { .. } => 4,
            Self::StoreRegisterMem { .. } | Self::LoadRegisterMem { .. } => 4,
            Self::Atomic { .. } => 11,
            Self::SemaphoreWait { .. } => 5,
            Self::ConditionalBatchEnd { .. } => 4,
            Self::HwLock | Self::HwUnlock => 2,
            Self::InsertEos(_) => 4,
            Self::BatchBufferEnd => 1,
        }
    }

    pub fn is_semaphore_op(&self) -> bool {
        matches!(
            self,
            Self::Atomic { .. } | Self::SemaphoreWait { .. } | Self::MiFlush { post_sync: Some(_) }
        )
    }
}

/// In-memory command buffer for one pipe. The epilogue runs even when a
/// conditional batch end truncates the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    ops: Vec<HwCommand>,
    epilogue: Vec<HwCommand>,
    capacity_dwords: usize,
    used_dwords: usize,
}

impl CommandBuffer {
    pub fn with_capacity(capacity_dwords: usize) -> Self {
        Self {
            ops: Vec::new(),
            epilogue: Vec::new(),
            capacity_dwords,
            used_dwords: 0,
        }
    }

    fn reserve(&mut self, dwords: usize) -> Result<()> {
        let used = self.used_dwords + dwords;
        if used > self.capacity_dwords {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "command buffer overflow: {used} > {} dwords",
                self.capacity_dwords
            )));
        }
        self.used_dwords = used;
        Ok(())
    }

    pub fn emit(&mut self, cmd: HwCommand) -> Result<()> {
        self.reserve(cmd.dword_size())?;
        self.ops.push(cmd);
        Ok(())
    }

    pub fn emit_epilogue(&mut self, cmd: HwCommand) -> Result<()> {
        self.reserve(cmd.dword_size())?;
        self.epilogue.push(cmd);
        Ok(())
    }

    /// Appends another segment's body and epilogue.
    pub fn append(&mut self, other: CommandBuffer) -> Result<()> {
        self.reserve(other.used_dwords)?;
        self.ops.extend(other.ops);
        self.epilogue.extend(other.epilogue);
        Ok(())
    }

    pub fn ops(&self) -> &[HwCommand] {
        &self.ops
    }

    pub fn epilogue(&self) -> &[HwCommand] {
        &self.epilogue
    }

    pub fn used_dwords(&self) -> usize {
        self.used_dwords
    }

    pub fn capacity_dwords(&self) -> usize {
        self.capacity_dwords
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.epilogue.is_empty()
    }

    pub fn count(&self, pred: impl Fn(&HwCommand) -> bool) -> usize {
        self.ops.iter().chain(&self.epilogue).filter(|c| pred(c)).count()
    }
}

use std::fmt;

use crate::command::{AtomicOp, CommandBuffer, HwCommand, SemaphoreCompare};
use crate::contract::{OrchestrationError, Result};
use crate::platform::PlatformSettings;
use crate::resource::{GpuAddress, MemoryServices, ResourceHandle, ResourceSpec};
use crate::tile::TileGrid;

const ALL_PIPES: u32 = 0;
const OTHER_PIPES_FOR_ONE: u32 = 4;
const ONE_PIPE_FOR_ANOTHER: u32 = 8;
const DELAY_SCRATCH: u32 = 12;
const PIPE_SLOTS: u32 = 16;
const DELAY_MARKER: u32 = 0xDE1A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Single,
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeContext {
    pub index: u8,
    pub num_pipes: u8,
}

impl PipeContext {
    pub fn new(index: u8, num_pipes: u8) -> Self {
        Self { index, num_pipes }
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.num_pipes
    }

    pub fn is_multi(&self) -> bool {
        self.num_pipes > 1
    }

    pub fn role(&self) -> PipeRole {
        match (self.is_first(), self.is_last()) {
            (true, true) => PipeRole::Single,
            (true, false) => PipeRole::First,
            (false, true) => PipeRole::Last,
            (false, false) => PipeRole::Middle,
        }
    }
}

impl fmt::Display for PipeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe {}/{}", self.index, self.num_pipes)
    }
}

/// Multi-pipe planning and the GPU-side semaphore primitives that let pipes
/// rendezvous. Nothing here blocks the CPU.
#[derive(Debug)]
pub struct Scalability {
    vdbox_count: u8,
    delay_count: u32,
    semaphores: ResourceHandle,
}

impl Scalability {
    pub fn new(
        settings: &PlatformSettings,
        vdbox_count: u8,
        memory: &dyn MemoryServices,
    ) -> Result<Self> {
        let size = PIPE_SLOTS as usize + usize::from(settings.max_vdbox) * 4;
        let semaphores = memory.allocate(&ResourceSpec::new("pipe_semaphores", size))?;
        Ok(Self {
            vdbox_count: vdbox_count.min(settings.max_vdbox).max(1),
            delay_count: settings.semaphore_delay_count.max(1),
            semaphores,
        })
    }

    /// One pipe per tile column when the engines allow it, otherwise one.
    pub fn num_pipes(&self, tiles: Option<&TileGrid>) -> u8 {
        match tiles {
            Some(grid) if grid.columns() > 1 && grid.columns() <= u32::from(self.vdbox_count) => {
                grid.columns() as u8
            }
            _ => 1,
        }
    }

    fn addr(&self, offset: u32) -> GpuAddress {
        GpuAddress::new(self.semaphores, offset)
    }

    pub fn pipe_slot(&self, pipe: u8) -> GpuAddress {
        self.addr(PIPE_SLOTS + u32::from(pipe) * 4)
    }

    /// Clears every semaphore. Only the first pipe may do this, once per frame.
    pub fn reset_semaphores(&self, cb: &mut CommandBuffer, pipe: &PipeContext) -> Result<()> {
        if !pipe.is_first() {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{pipe} may not reset pipe semaphores"
            )));
        }
        for offset in [ALL_PIPES, OTHER_PIPES_FOR_ONE, ONE_PIPE_FOR_ANOTHER, DELAY_SCRATCH] {
            cb.emit(HwCommand::StoreDataImm {
                addr: self.addr(offset),
                value: 0,
            })?;
        }
        for index in 0..pipe.num_pipes {
            cb.emit(HwCommand::StoreDataImm {
                addr: self.pipe_slot(index),
                value: 0,
            })?;
        }
        Ok(())
    }

    /// First pipe releases the others, which wait and then consume one count.
    pub fn sync_other_pipes_for_one(&self, cb: &mut CommandBuffer, pipe: &PipeContext) -> Result<()> {
        let addr = self.addr(OTHER_PIPES_FOR_ONE);
        if pipe.is_first() {
            cb.emit(HwCommand::Atomic {
                addr,
                op: AtomicOp::Add,
                operand: u32::from(pipe.num_pipes - 1),
            })
        } else {
            cb.emit(HwCommand::SemaphoreWait {
                addr,
                compare: SemaphoreCompare::NotEqual,
                value: 0,
            })?;
            cb.emit(HwCommand::Atomic {
                addr,
                op: AtomicOp::Sub,
                operand: 1,
            })
        }
    }

    /// Every pipe publishes `pass + 1`; the last pipe waits for all of them.
    pub fn sync_one_pipe_wait_others(
        &self,
        cb: &mut CommandBuffer,
        pipe: &PipeContext,
        pass: u8,
    ) -> Result<()> {
        let marker = u32::from(pass) + 1;
        cb.emit(HwCommand::MiFlush {
            post_sync: Some((self.pipe_slot(pipe.index), marker)),
        })?;
        if pipe.is_last() {
            for other in (0..pipe.num_pipes).filter(|i| *i != pipe.index) {
                cb.emit(HwCommand::SemaphoreWait {
                    addr: self.pipe_slot(other),
                    compare: SemaphoreCompare::Equal,
                    value: marker,
                })?;
            }
        }
        Ok(())
    }

    /// Last pipe tells the first one that its integration is done.
    pub fn signal_one_pipe_for_another(&self, cb: &mut CommandBuffer, pipe: &PipeContext) -> Result<()> {
        debug_assert!(pipe.is_last());
        cb.emit(HwCommand::Atomic {
            addr: self.addr(ONE_PIPE_FOR_ANOTHER),
            op: AtomicOp::Add,
            operand: 1,
        })
    }

    pub fn wait_one_pipe_for_another(&self, cb: &mut CommandBuffer, pipe: &PipeContext) -> Result<()> {
        debug_assert!(pipe.is_first());
        let addr = self.addr(ONE_PIPE_FOR_ANOTHER);
        cb.emit(HwCommand::SemaphoreWait {
            addr,
            compare: SemaphoreCompare::Equal,
            value: 1,
        })?;
        cb.emit(HwCommand::Atomic {
            addr,
            op: AtomicOp::Sub,
            operand: 1,
        })
    }

    /// Barrier across all pipes of the frame.
    pub fn sync_all_pipes(&self, cb: &mut CommandBuffer, pipe: &PipeContext) -> Result<()> {
        let addr = self.addr(ALL_PIPES);
        cb.emit(HwCommand::Atomic {
            addr,
            op: AtomicOp::Add,
            operand: 1,
        })?;
        cb.emit(HwCommand::SemaphoreWait {
            addr,
            compare: SemaphoreCompare::Equal,
            value: u32::from(pipe.num_pipes),
        })?;
        for _ in 0..self.delay_count {
            cb.emit(HwCommand::StoreDataImm {
                addr: self.addr(DELAY_SCRATCH),
                value: DELAY_MARKER,
            })?;
        }
        cb.emit(HwCommand::Atomic {
            addr,
            op: AtomicOp::Sub,
            operand: 1,
        })
    }

    pub fn lock(&self, cb: &mut CommandBuffer) -> Result<()> {
        cb.emit(HwCommand::HwLock)
    }

    pub fn unlock(&self, cb: &mut CommandBuffer) -> Result<()> {
        cb.emit(HwCommand::HwUnlock)
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::contract::{FrameSeq, OrchestrationError, Result};
use crate::resource::{
    GpuAddress, LockMode, MemoryServices, ResourceHandle, ResourceSpec, ScopedLock,
};
use crate::ring::SlotIndex;

pub const STATUS_RECORD_BYTES: usize = 64;

/// Fixed u32 fields of a per-frame status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    QueryStart,
    BitstreamBytes,
    Qp,
    NumPasses,
    ImageStatusCtrl,
    HucStatus,
    HucStatusMask,
    HucStatus2,
    Sse,
    LookaheadBytes,
    QueryEnd,
}

impl StatusField {
    pub const fn offset(self) -> u32 {
        match self {
            Self::QueryStart => 0,
            Self::BitstreamBytes => 4,
            Self::Qp => 8,
            Self::NumPasses => 12,
            Self::ImageStatusCtrl => 16,
            Self::HucStatus => 20,
            Self::HucStatusMask => 24,
            Self::HucStatus2 => 28,
            Self::Sse => 32,
            Self::LookaheadBytes => 36,
            Self::QueryEnd => 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportHandle {
    pub seq: FrameSeq,
    pub slot: SlotIndex,
    record: ResourceHandle,
}

impl ReportHandle {
    pub fn address(&self, field: StatusField) -> GpuAddress {
        GpuAddress::new(self.record, field.offset())
    }
}

/// Raw GPU-written contents of a status record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub query_start: u32,
    pub bitstream_bytes: u32,
    pub qp: u32,
    pub num_passes: u32,
    pub image_status_ctrl: u32,
    pub huc_status: u32,
    pub huc_status_mask: u32,
    pub huc_status2: u32,
    pub sse: u32,
    pub lookahead_bytes: u32,
    pub query_end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    Complete,
    Error,
}

impl fmt::Display for CodecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Result handed to the caller once a frame's GPU work is observed complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReportData {
    pub frame_seq: FrameSeq,
    pub status: CodecStatus,
    pub bitstream_bytes: u32,
    pub qp: u8,
    pub passes: u8,
    pub tile_sizes: Vec<u32>,
    pub sse: u64,
    pub lookahead_bytes: u32,
    pub error: Option<OrchestrationError>,
}

impl StatusReportData {
    /// Report for a frame whose counters cannot be trusted.
    pub fn failed(frame_seq: FrameSeq, err: OrchestrationError) -> Self {
        Self {
            frame_seq,
            status: CodecStatus::Error,
            bitstream_bytes: 0,
            qp: 0,
            passes: 0,
            tile_sizes: Vec::new(),
            sse: 0,
            lookahead_bytes: 0,
            error: Some(err),
        }
    }

    pub fn fail(&mut self, err: OrchestrationError) {
        self.status = CodecStatus::Error;
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CodecStatus::Complete
    }
}

/// Asynchronous per-frame status. Records live in ring slots; a single global
/// tag written by the last pipe's epilogue tells which frames have finished.
pub struct StatusReport {
    memory: Arc<dyn MemoryServices>,
    tag: ResourceHandle,
    pending: VecDeque<ReportHandle>,
}

impl StatusReport {
    pub fn new(memory: Arc<dyn MemoryServices>) -> Result<Self> {
        let tag = memory.allocate(&ResourceSpec::new("status_tag", 8))?;
        Ok(Self {
            memory,
            tag,
            pending: VecDeque::new(),
        })
    }

    pub fn tag_address(&self) -> GpuAddress {
        GpuAddress::new(self.tag, 0)
    }

    /// Clears the slot's record and registers the frame as pending.
    pub fn begin(
        &mut self,
        seq: FrameSeq,
        slot: SlotIndex,
        record: ResourceHandle,
    ) -> Result<ReportHandle> {
        let mut lock = ScopedLock::acquire(self.memory.as_ref(), record, LockMode::Write)?;
        lock.fill(0);
        lock.write_u32(StatusField::QueryStart.offset() as usize, seq.0)?;
        lock.commit()?;
        let handle = ReportHandle { seq, slot, record };
        self.pending.push_back(handle);
        debug!(%seq, %slot, "status report begun");
        Ok(handle)
    }

    /// Drops a report whose frame never reached submission.
    pub fn discard(&mut self, handle: &ReportHandle) {
        self.pending.retain(|h| h != handle);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn read_tag(&self) -> Result<Option<u32>> {
        let lock = ScopedLock::acquire(self.memory.as_ref(), self.tag, LockMode::Read)?;
        let written = lock.read_u32(4)? != 0;
        let value = lock.read_u32(0)?;
        Ok(written.then_some(value))
    }

    /// Pops every pending report the hardware tag has reached, oldest first.
    pub fn poll(&mut self) -> Result<Vec<ReportHandle>> {
        let Some(tag) = self.read_tag()? else {
            return Ok(Vec::new());
        };
        let mut done = Vec::new();
        while let Some(front) = self.pending.front() {
            if !front.seq.is_reached_by(tag) {
                break;
            }
            if let Some(handle) = self.pending.pop_front() {
                done.push(handle);
            }
        }
        Ok(done)
    }

    pub fn read(&self, handle: &ReportHandle) -> Result<StatusRecord> {
        let lock = ScopedLock::acquire(self.memory.as_ref(), handle.record, LockMode::Read)?;
        let field = |f: StatusField| lock.read_u32(f.offset() as usize);
        Ok(StatusRecord {
            query_start: field(StatusField::QueryStart)?,
            bitstream_bytes: field(StatusField::BitstreamBytes)?,
            qp: field(StatusField::Qp)?,
            num_passes: field(StatusField::NumPasses)?,
            image_status_ctrl: field(StatusField::ImageStatusCtrl)?,
            huc_status: field(StatusField::HucStatus)?,
            huc_status_mask: field(StatusField::HucStatusMask)?,
            huc_status2: field(StatusField::HucStatus2)?,
            sse: field(StatusField::Sse)?,
            lookahead_bytes: field(StatusField::LookaheadBytes)?,
            query_end: field(StatusField::QueryEnd)?,
        })
    }

    /// Turns a raw record into caller-facing data. The sequence always comes
    /// from the handle that began the report.
    pub fn complete(&self, handle: &ReportHandle, record: &StatusRecord) -> StatusReportData {
        let mut data = StatusReportData {
            frame_seq: handle.seq,
            status: CodecStatus::Complete,
            bitstream_bytes: record.bitstream_bytes,
            qp: u8::try_from(record.qp).unwrap_or(u8::MAX),
            passes: u8::try_from(record.num_passes).unwrap_or(u8::MAX),
            tile_sizes: Vec::new(),
            sse: u64::from(record.sse),
            lookahead_bytes: record.lookahead_bytes,
            error: None,
        };
        if record.query_start != handle.seq.0 {
            data.fail(OrchestrationError::Collaborator(format!(
                "status record of {} overwritten (start tag {})",
                handle.seq, record.query_start
            )));
        } else if record.query_end != handle.seq.0 {
            data.fail(OrchestrationError::HardwareRejected(format!(
                "{} never reached its epilogue (end tag {})",
                handle.seq, record.query_end
            )));
        }
        data
    }
}

impl fmt::Debug for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReport")
            .field("tag", &self.tag)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HostMemory;

    fn setup() -> (Arc<HostMemory>, StatusReport) {
        let memory = Arc::new(HostMemory::new());
        let report = StatusReport::new(memory.clone()).unwrap();
        (memory, report)
    }

    fn write_tag(memory: &HostMemory, report: &StatusReport, seq: u32) {
        let tag = report.tag_address();
        memory.write_u32(tag, seq).unwrap();
        memory.write_u32(tag.add(4), 1).unwrap();
    }

    #[test]
    fn begin_complete_round_trips_sequence() {
        let (memory, mut report) = setup();
        let record = memory.allocate(&ResourceSpec::new("rec", STATUS_RECORD_BYTES)).unwrap();
        let handle = report.begin(FrameSeq(42), SlotIndex(3), record).unwrap();
        memory
            .write_u32(handle.address(StatusField::BitstreamBytes), 1234)
            .unwrap();
        memory.write_u32(handle.address(StatusField::QueryEnd), 42).unwrap();
        write_tag(&memory, &report, 42);

        let done = report.poll().unwrap();
        assert_eq!(done, vec![handle]);
        let raw = report.read(&done[0]).unwrap();
        let data = report.complete(&done[0], &raw);
        assert_eq!(data.frame_seq, FrameSeq(42));
        assert_eq!(data.bitstream_bytes, 1234);
        assert!(data.is_ok());
    }

    #[test]
    fn poll_completes_in_fifo_order_up_to_tag() {
        let (memory, mut report) = setup();
        let mut handles = Vec::new();
        for seq in 0..3 {
            let record = memory.allocate(&ResourceSpec::new("rec", STATUS_RECORD_BYTES)).unwrap();
            handles.push(report.begin(FrameSeq(seq), SlotIndex(seq as usize), record).unwrap());
        }
        assert!(report.poll().unwrap().is_empty());
        write_tag(&memory, &report, 1);
        assert_eq!(report.poll().unwrap(), handles[..2].to_vec());
        assert_eq!(report.pending_len(), 1);
    }

    #[test]
    fn discarded_report_never_completes() {
        let (memory, mut report) = setup();
        let record = memory.allocate(&ResourceSpec::new("rec", STATUS_RECORD_BYTES)).unwrap();
        let handle = report.begin(FrameSeq(0), SlotIndex(0), record).unwrap();
        report.discard(&handle);
        write_tag(&memory, &report, 0);
        assert!(report.poll().unwrap().is_empty());
    }

    #[test]
    fn overwritten_record_is_flagged() {
        let (memory, mut report) = setup();
        let record = memory.allocate(&ResourceSpec::new("rec", STATUS_RECORD_BYTES)).unwrap();
        let handle = report.begin(FrameSeq(5), SlotIndex(0), record).unwrap();
        memory.write_u32(handle.address(StatusField::QueryStart), 6).unwrap();
        let raw = report.read(&handle).unwrap();
        let data = report.complete(&handle, &raw);
        assert_eq!(data.frame_seq, FrameSeq(5));
        assert_eq!(data.status, CodecStatus::Error);
    }

    #[test]
    fn missing_end_tag_is_a_hardware_rejection() {
        let (memory, mut report) = setup();
        let record = memory.allocate(&ResourceSpec::new("rec", STATUS_RECORD_BYTES)).unwrap();
        let handle = report.begin(FrameSeq(7), SlotIndex(0), record).unwrap();
        let raw = report.read(&handle).unwrap();
        let data = report.complete(&handle, &raw);
        assert!(matches!(data.error, Some(OrchestrationError::HardwareRejected(_))));
    }
}

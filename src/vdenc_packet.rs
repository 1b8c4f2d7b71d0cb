use crate::command::{CommandBuffer, EosKind, HwCommand, Register};
use crate::contract::{OrchestrationError, Result};
use crate::packet::{BuildContext, Capability, CompletionContext, EncodePacket, PacketKind};
use crate::resource::GpuAddress;
use crate::status::{StatusField, StatusReportData};
use crate::tile::TileGrid;

/// Picture, slice and tile level HEVC VDENC commands for one pass on one pipe.
#[derive(Debug, Default)]
pub struct HevcVdencPkt {
    activations: u64,
}

impl HevcVdencPkt {
    fn add_picture_level(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let pipe = ctx.pipe;
        let pass = ctx.pass.index;

        if pipe.is_multi() {
            if ctx.pass.is_first() && pipe.is_first() {
                ctx.scalability.reset_semaphores(cb, &pipe)?;
            }
            ctx.scalability.sync_other_pipes_for_one(cb, &pipe)?;
        }

        if ctx.features.is_conditional(pass) {
            ctx.emit_convergence_end(cb)?;
        }

        if pipe.is_first() {
            cb.emit(HwCommand::StoreDataImm {
                addr: ctx.report.address(StatusField::QueryStart),
                value: ctx.frame.seq.0,
            })?;
        }

        cb.emit(HwCommand::PipeModeSelect {
            pipe: pipe.index,
            num_pipes: pipe.num_pipes,
        })?;
        cb.emit(HwCommand::SurfaceState)?;
        cb.emit(HwCommand::PipeBufAddrState)?;
        cb.emit(HwCommand::IndObjBaseAddrState)?;
        cb.emit(HwCommand::HcpPicState { qp: ctx.frame.qp })?;
        if ctx.features.brc.firmware {
            cb.emit(HwCommand::BatchBufferStart {
                second_level: ctx.second_level_batch()?,
            })?;
        }
        cb.emit(HwCommand::VdencPicState {
            stream_in: ctx.features.stream_in(pass),
            roi_regions: ctx.features.roi_count,
        })
    }

    fn add_slice_level(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let slices = &ctx.frame.slices;
        if slices.is_empty() {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{} has no slices",
                ctx.frame.seq
            )));
        }
        for (i, slice) in slices.iter().enumerate() {
            cb.emit(HwCommand::SliceState {
                start_lcu: slice.start_lcu,
                num_lcus: slice.num_lcus,
                last: i + 1 == slices.len(),
            })?;
            cb.emit(HwCommand::VdencWalker {
                lcus: slice.num_lcus,
            })?;
            cb.emit(HwCommand::VdPipelineFlush)?;
        }
        self.add_end_markers(ctx, cb)?;
        cb.emit(HwCommand::MiFlush { post_sync: None })?;
        self.store_frame_counters(ctx, cb)?;
        self.store_report_fields(ctx, cb)?;
        if let Some(entry) = ctx.lookahead_stats {
            self.store_lookahead(ctx, cb, Register::HcpFrameBytes, entry)?;
        }
        Ok(())
    }

    fn add_tile_level(
        &self,
        ctx: &BuildContext<'_>,
        grid: &TileGrid,
        cb: &mut CommandBuffer,
    ) -> Result<()> {
        let pipe = ctx.pipe;
        let mut coded = 0;
        for tile in grid.tiles_for_pipe(pipe.index, pipe.num_pipes) {
            let slice = grid
                .slice_of(tile)
                .and_then(|i| ctx.frame.slices.get(i))
                .ok_or_else(|| {
                    OrchestrationError::InvalidConfiguration(format!(
                        "tile {} carries no slice",
                        tile.index
                    ))
                })?;
            cb.emit(HwCommand::TileCoding(tile.coding()))?;
            cb.emit(HwCommand::SliceState {
                start_lcu: slice.start_lcu,
                num_lcus: slice.num_lcus,
                last: tile.last_in_frame,
            })?;
            cb.emit(HwCommand::VdencWalker {
                lcus: slice.num_lcus,
            })?;
            cb.emit(HwCommand::VdPipelineFlush)?;

            let stats = ctx.slot.tile_stats(tile.index);
            ctx.scalability.lock(cb)?;
            cb.emit(HwCommand::StoreRegisterMem {
                register: Register::HcpTileBytes,
                addr: stats,
            })?;
            cb.emit(HwCommand::StoreRegisterMem {
                register: Register::HcpTileSse,
                addr: stats.add(4),
            })?;
            ctx.scalability.unlock(cb)?;
            coded += 1;
        }
        if coded == 0 {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{} has no tiles to encode",
                pipe
            )));
        }

        self.add_end_markers(ctx, cb)?;
        cb.emit(HwCommand::VdControlFlush)?;
        if pipe.is_multi() {
            ctx.scalability.sync_all_pipes(cb, &pipe)?;
            ctx.scalability.sync_one_pipe_wait_others(cb, &pipe, ctx.pass.index)?;
        } else {
            self.store_frame_counters(ctx, cb)?;
        }
        if pipe.is_last() {
            cb.emit(HwCommand::StoreRegisterMem {
                register: Register::HcpQp,
                addr: ctx.report.address(StatusField::Qp),
            })?;
            cb.emit(HwCommand::StoreRegisterMem {
                register: Register::HcpImageStatusCtrl,
                addr: ctx.report.address(StatusField::ImageStatusCtrl),
            })?;
        }
        Ok(())
    }

    fn add_end_markers(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        if !ctx.pipe.is_last() {
            return Ok(());
        }
        if ctx.frame.last_pic_in_seq {
            cb.emit(HwCommand::InsertEos(EosKind::EndOfSequence))?;
        }
        if ctx.frame.last_pic_in_stream {
            cb.emit(HwCommand::InsertEos(EosKind::EndOfStream))?;
        }
        Ok(())
    }

    /// Per-pass size and distortion the firmware reads on the next pass.
    fn store_frame_counters(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let stats = ctx.slot.pass_stats(ctx.pass.index);
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::HcpFrameBytes,
            addr: stats,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::HcpFrameSse,
            addr: stats.add(4),
        })
    }

    fn store_report_fields(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let report = ctx.report;
        for (register, field) in [
            (Register::HcpFrameBytes, StatusField::BitstreamBytes),
            (Register::HcpFrameSse, StatusField::Sse),
            (Register::HcpQp, StatusField::Qp),
            (Register::HcpImageStatusCtrl, StatusField::ImageStatusCtrl),
        ] {
            cb.emit(HwCommand::StoreRegisterMem {
                register,
                addr: report.address(field),
            })?;
        }
        cb.emit(HwCommand::StoreDataImm {
            addr: report.address(StatusField::NumPasses),
            value: u32::from(ctx.pass.index) + 1,
        })
    }

    fn store_lookahead(
        &self,
        ctx: &BuildContext<'_>,
        cb: &mut CommandBuffer,
        register: Register,
        entry: GpuAddress,
    ) -> Result<()> {
        cb.emit(HwCommand::StoreRegisterMem {
            register,
            addr: entry,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register,
            addr: ctx.report.address(StatusField::LookaheadBytes),
        })
    }
}

impl EncodePacket for HevcVdencPkt {
    fn kind(&self) -> PacketKind {
        PacketKind::VdencPicture
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::BuildsPicture,
            Capability::BuildsSlice,
            Capability::BuildsTile,
        ]
    }

    fn build(&mut self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        ctx.emit_prolog(cb)?;
        self.add_picture_level(ctx, cb)?;
        match &ctx.features.tiles {
            Some(grid) => self.add_tile_level(ctx, grid, cb)?,
            None => self.add_slice_level(ctx, cb)?,
        }
        self.activations += 1;
        Ok(())
    }

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> Result<()> {
        let planned = ctx.features.num_passes();
        if report.passes == 0 {
            report.fail(OrchestrationError::HardwareRejected(format!(
                "{} finished without executing a pass",
                report.frame_seq
            )));
        } else if report.passes > planned {
            report.fail(OrchestrationError::Collaborator(format!(
                "{} reports {} passes, {planned} planned",
                report.frame_seq, report.passes
            )));
        }
        Ok(())
    }

    fn activations(&self) -> u64 {
        self.activations
    }
}

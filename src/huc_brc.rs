use crate::brc::BrcUpdateParams;
use crate::command::{CommandBuffer, HucFirmware, HwCommand, Register};
use crate::contract::{OrchestrationError, Result};
use crate::packet::{BuildContext, Capability, CompletionContext, EncodePacket, PacketKind};
use crate::resource::{GpuAddress, LockMode, ScopedLock};
use crate::ring::DMEM_BYTES;
use crate::status::{StatusField, StatusReportData};

fn emit_huc_run(
    ctx: &BuildContext<'_>,
    cb: &mut CommandBuffer,
    firmware: HucFirmware,
    dmem: GpuAddress,
    regions: Vec<(u8, GpuAddress)>,
) -> Result<()> {
    cb.emit(HwCommand::HucImem { firmware })?;
    cb.emit(HwCommand::StoreRegisterMem {
        register: Register::HucStatus2,
        addr: ctx.report.address(StatusField::HucStatus2),
    })?;
    cb.emit(HwCommand::HucDmem {
        source: dmem,
        len: DMEM_BYTES as u32,
    })?;
    cb.emit(HwCommand::HucVirtualAddr { regions })?;
    cb.emit(HwCommand::HucStart {
        last_stream_object: true,
    })?;
    cb.emit(HwCommand::VdPipelineFlush)?;
    cb.emit(HwCommand::MiFlush { post_sync: None })
}

fn check_authenticated(
    ctx: &CompletionContext<'_>,
    report: &mut StatusReportData,
    firmware: HucFirmware,
) {
    if !ctx.firmware_authenticated() {
        report.fail(OrchestrationError::HardwareRejected(format!(
            "{firmware} ran without an authenticated huc image (status2 {:#x})",
            ctx.record.huc_status2
        )));
    }
}

/// Writes the initial rate-control parameters for the firmware.
#[derive(Debug, Default)]
pub struct HucBrcInitPkt {
    activations: u64,
}

impl EncodePacket for HucBrcInitPkt {
    fn kind(&self) -> PacketKind {
        PacketKind::HucBrcInit
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RunsFirmware]
    }

    fn build(&mut self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let init = ctx.features.brc.init.as_ref().ok_or_else(|| {
            OrchestrationError::InvalidConfiguration(
                "brc init activated without init parameters".to_string(),
            )
        })?;

        let mut dmem = ScopedLock::acquire(ctx.memory, ctx.slot.brc_init_dmem, LockMode::Write)?;
        dmem.write_words(&init.to_dmem())?;
        dmem.commit()?;

        ctx.emit_prolog(cb)?;
        emit_huc_run(
            ctx,
            cb,
            HucFirmware::BrcInit,
            GpuAddress::new(ctx.slot.brc_init_dmem, 0),
            vec![(0, ctx.brc_history)],
        )?;
        self.activations += 1;
        Ok(())
    }

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> Result<()> {
        check_authenticated(ctx, report, HucFirmware::BrcInit);
        Ok(())
    }

    fn activations(&self) -> u64 {
        self.activations
    }
}

/// Runs the BRC firmware once per pass and publishes its re-encode verdict
/// for the conditional batch ends that follow.
#[derive(Debug, Default)]
pub struct HucBrcUpdatePkt {
    activations: u64,
}

impl EncodePacket for HucBrcUpdatePkt {
    fn kind(&self) -> PacketKind {
        PacketKind::HucBrcUpdate
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RunsFirmware]
    }

    fn build(&mut self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let pass = ctx.pass.index;
        let dmem_handle = *ctx
            .slot
            .brc_update_dmem
            .get(usize::from(pass))
            .ok_or_else(|| {
                OrchestrationError::InvalidConfiguration(format!("no update dmem for pass {pass}"))
            })?;
        let params = BrcUpdateParams {
            target_frame_bytes: ctx.features.brc.target_frame_bytes,
            pass,
            max_passes: ctx.pass.num_passes,
            picture_type: ctx.frame.picture_type,
            frame_number: ctx.frame.seq.0,
            roi_count: ctx.features.roi_count,
            stream_in: ctx.features.stream_in(pass),
        };
        let mut dmem = ScopedLock::acquire(ctx.memory, dmem_handle, LockMode::Write)?;
        dmem.write_words(&params.to_dmem())?;
        dmem.commit()?;

        ctx.emit_prolog(cb)?;
        // From the third pass on the firmware only runs if the previous one
        // asked for a re-encode.
        if pass >= 2 && ctx.features.is_conditional(pass) {
            ctx.emit_convergence_end(cb)?;
        }
        if ctx.pipe.is_multi() && pass >= 1 {
            ctx.scalability.wait_one_pipe_for_another(cb, &ctx.pipe)?;
        }

        emit_huc_run(
            ctx,
            cb,
            HucFirmware::BrcUpdate,
            GpuAddress::new(dmem_handle, 0),
            vec![
                (0, ctx.brc_history),
                (1, ctx.slot.pass_stats(0)),
                (2, ctx.second_level_batch()?),
            ],
        )?;

        let mask = ctx.settings.huc_reencode_mask;
        let convergence = ctx.slot.convergence();
        cb.emit(HwCommand::StoreDataImm {
            addr: convergence.add(4),
            value: mask,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::HucStatus,
            addr: convergence,
        })?;
        cb.emit(HwCommand::StoreDataImm {
            addr: ctx.report.address(StatusField::HucStatusMask),
            value: mask,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::HucStatus,
            addr: ctx.report.address(StatusField::HucStatus),
        })?;
        self.activations += 1;
        Ok(())
    }

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> Result<()> {
        check_authenticated(ctx, report, HucFirmware::BrcUpdate);
        Ok(())
    }

    fn activations(&self) -> u64 {
        self.activations
    }
}

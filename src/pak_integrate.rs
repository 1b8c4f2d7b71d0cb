use crate::command::{CommandBuffer, HucFirmware, HwCommand, Register};
use crate::contract::{OrchestrationError, Result};
use crate::feature::FrameFeatures;
use crate::packet::{BuildContext, Capability, CompletionContext, EncodePacket, PacketKind};
use crate::resource::{GpuAddress, LockMode, ScopedLock};
use crate::ring::DMEM_BYTES;
use crate::status::{StatusField, StatusReportData};

mod dmem {
    pub const NUM_TILES: usize = 0;
    pub const PASS: usize = 1;
    pub const NUM_PIPES: usize = 2;
    pub const WORDS: usize = 3;
}

/// Merges per-tile statistics into frame totals after every pipe has
/// finished a pass, and hands the first pipe its go-ahead for the next one.
#[derive(Debug, Default)]
pub struct PakIntegratePkt {
    activations: u64,
}

impl PakIntegratePkt {
    /// The merge only needs the HuC when BRC reads the totals or several
    /// pipes wrote partial statistics.
    fn uses_huc(features: &FrameFeatures, num_pipes: u8) -> bool {
        features.brc.firmware || num_pipes > 1
    }

    fn emit_integrate(&self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        let mut words = [0u32; dmem::WORDS];
        words[dmem::NUM_TILES] = ctx.features.tile_count() as u32;
        words[dmem::PASS] = u32::from(ctx.pass.index);
        words[dmem::NUM_PIPES] = u32::from(ctx.pipe.num_pipes);
        let mut lock = ScopedLock::acquire(ctx.memory, ctx.slot.integrate_dmem, LockMode::Write)?;
        lock.write_words(&words)?;
        lock.commit()?;

        cb.emit(HwCommand::HucImem {
            firmware: HucFirmware::PakIntegrate,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::HucStatus2,
            addr: ctx.report.address(StatusField::HucStatus2),
        })?;
        cb.emit(HwCommand::HucDmem {
            source: GpuAddress::new(ctx.slot.integrate_dmem, 0),
            len: DMEM_BYTES as u32,
        })?;
        cb.emit(HwCommand::HucVirtualAddr {
            regions: vec![
                (0, ctx.slot.tile_stats(0)),
                (1, ctx.slot.pass_stats(ctx.pass.index)),
            ],
        })?;
        cb.emit(HwCommand::HucStart {
            last_stream_object: true,
        })?;
        cb.emit(HwCommand::VdPipelineFlush)?;
        cb.emit(HwCommand::MiFlush { post_sync: None })
    }

    fn copy(cb: &mut CommandBuffer, from: GpuAddress, to: GpuAddress) -> Result<()> {
        cb.emit(HwCommand::LoadRegisterMem {
            register: Register::Gpr0,
            addr: from,
        })?;
        cb.emit(HwCommand::StoreRegisterMem {
            register: Register::Gpr0,
            addr: to,
        })
    }
}

impl EncodePacket for PakIntegratePkt {
    fn kind(&self) -> PacketKind {
        PacketKind::PakIntegrate
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::BuildsTile, Capability::RunsFirmware]
    }

    fn build(&mut self, ctx: &BuildContext<'_>, cb: &mut CommandBuffer) -> Result<()> {
        if ctx.features.tiles.is_none() {
            return Err(OrchestrationError::InvalidConfiguration(
                "pak integration activated for an untiled frame".to_string(),
            ));
        }
        if !ctx.pipe.is_last() {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "pak integration runs on the last pipe, not {}",
                ctx.pipe
            )));
        }

        ctx.emit_prolog(cb)?;
        if ctx.features.is_conditional(ctx.pass.index) {
            ctx.emit_convergence_end(cb)?;
        }
        if Self::uses_huc(ctx.features, ctx.pipe.num_pipes) {
            self.emit_integrate(ctx, cb)?;
        }

        let stats = ctx.slot.pass_stats(ctx.pass.index);
        Self::copy(cb, stats, ctx.report.address(StatusField::BitstreamBytes))?;
        Self::copy(cb, stats.add(4), ctx.report.address(StatusField::Sse))?;
        if let Some(entry) = ctx.lookahead_stats {
            Self::copy(cb, stats, entry)?;
            Self::copy(cb, stats, ctx.report.address(StatusField::LookaheadBytes))?;
        }
        cb.emit(HwCommand::StoreDataImm {
            addr: ctx.report.address(StatusField::NumPasses),
            value: u32::from(ctx.pass.index) + 1,
        })?;

        if ctx.pipe.is_multi() && !ctx.pass.is_last() {
            ctx.scalability.signal_one_pipe_for_another(cb, &ctx.pipe)?;
        }
        self.activations += 1;
        Ok(())
    }

    fn completed(
        &mut self,
        ctx: &CompletionContext<'_>,
        report: &mut StatusReportData,
    ) -> Result<()> {
        let Some(grid) = ctx.features.tiles.as_ref() else {
            return Ok(());
        };
        if grid.len() > 1 {
            let lock = ScopedLock::acquire(ctx.memory, ctx.slot.tile_stats, LockMode::Read)?;
            report.tile_sizes = grid
                .tiles()
                .iter()
                .map(|t| lock.read_u32(ctx.slot.tile_stats(t.index).offset as usize))
                .collect::<Result<_>>()?;
        }
        if Self::uses_huc(ctx.features, ctx.num_pipes) && !ctx.firmware_authenticated() {
            report.fail(OrchestrationError::HardwareRejected(format!(
                "{} ran without an authenticated huc image (status2 {:#x})",
                HucFirmware::PakIntegrate,
                ctx.record.huc_status2
            )));
        }
        Ok(())
    }

    fn activations(&self) -> u64 {
        self.activations
    }

    fn runs_firmware(&self, features: &FrameFeatures, num_pipes: u8) -> bool {
        Self::uses_huc(features, num_pipes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FeatureConfig, PictureType, RateControlMode};
    use crate::test_support::Fixture;

    fn tiled(mode: RateControlMode) -> FeatureConfig {
        FeatureConfig {
            rate_control_mode: mode,
            tiling_enabled: true,
            ..FeatureConfig::default()
        }
    }

    #[test]
    fn refuses_untiled_frames() {
        let fx = Fixture::new(FeatureConfig::default(), 1, 1, PictureType::I);
        let mut pkt = PakIntegratePkt::default();
        let err = fx.build(&mut pkt, 0, 0).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
        assert_eq!(pkt.activations(), 0);
    }

    #[test]
    fn multi_pipe_runs_huc_and_signals_first_pipe() {
        let fx = Fixture::new(tiled(RateControlMode::Cbr), 2, 2, PictureType::P);
        assert_eq!(fx.num_pipes, 2);
        let mut pkt = PakIntegratePkt::default();
        let first = fx.build(&mut pkt, 0, 1).unwrap();
        assert_eq!(
            first.count(|c| matches!(c, HwCommand::HucImem { firmware: HucFirmware::PakIntegrate })),
            1
        );
        assert_eq!(first.count(|c| matches!(c, HwCommand::Atomic { .. })), 1);

        let last = fx.build(&mut pkt, 1, 1).unwrap();
        assert_eq!(last.count(|c| matches!(c, HwCommand::Atomic { .. })), 0);
        assert_eq!(last.count(|c| matches!(c, HwCommand::ConditionalBatchEnd { .. })), 1);
        assert_eq!(pkt.activations(), 2);
    }

    #[test]
    fn single_pipe_cqp_skips_firmware() {
        let fx = Fixture::new(tiled(RateControlMode::Cqp), 2, 1, PictureType::I);
        let mut pkt = PakIntegratePkt::default();
        let cb = fx.build(&mut pkt, 0, 0).unwrap();
        assert_eq!(cb.count(|c| matches!(c, HwCommand::HucStart { .. })), 0);
        assert_eq!(cb.count(|c| matches!(c, HwCommand::LoadRegisterMem { .. })), 2);
    }

    #[test]
    fn firmware_need_follows_pipes_and_brc() {
        let pkt = PakIntegratePkt::default();
        assert!(pkt.has(Capability::RunsFirmware));

        let cqp = Fixture::new(tiled(RateControlMode::Cqp), 2, 1, PictureType::I);
        assert!(!pkt.runs_firmware(&cqp.features, 1));
        assert!(pkt.runs_firmware(&cqp.features, 2));

        let cbr = Fixture::new(tiled(RateControlMode::Cbr), 2, 1, PictureType::P);
        assert!(pkt.runs_firmware(&cbr.features, 1));
    }

    #[test]
    fn must_run_on_last_pipe() {
        let fx = Fixture::new(tiled(RateControlMode::Cbr), 2, 2, PictureType::P);
        let mut pkt = PakIntegratePkt::default();
        let err = fx.build(&mut pkt, 0, 0).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
    }
}

use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::contract::{
    Dimensions, EncodeFrame, FeatureConfig, FrameSeq, PictureType, Result, SequenceParams,
    TileLayout,
};
use crate::feature::{FeatureSet, FrameFeatures};
use crate::packet::{BuildContext, CompletionContext, EncodePacket, PassContext};
use crate::platform::PlatformSettings;
use crate::resource::{GpuAddress, HostMemory};
use crate::ring::{SlotIndex, SlotResources};
use crate::scalability::{PipeContext, Scalability};
use crate::status::{ReportHandle, StatusRecord, StatusReport};

/// A 1080p frame with its features evaluated and one slot allocated, for
/// building single activations in isolation.
pub struct Fixture {
    pub memory: Arc<HostMemory>,
    pub settings: PlatformSettings,
    pub frame: EncodeFrame,
    pub features: FrameFeatures,
    pub slot: SlotResources,
    pub report: ReportHandle,
    pub scalability: Scalability,
    pub brc_history: GpuAddress,
    pub lookahead_stats: Option<GpuAddress>,
    pub num_pipes: u8,
    pub status: StatusReport,
}

impl Fixture {
    pub fn new(mut config: FeatureConfig, columns: u32, vdbox: u8, picture_type: PictureType) -> Self {
        let settings = PlatformSettings::default();
        let memory = Arc::new(HostMemory::new());
        let seq = SequenceParams::for_dims(Dimensions::new(1920, 1080).unwrap());
        let mut frame = EncodeFrame::new(FrameSeq(1), picture_type, seq);
        if config.tiling_enabled {
            let layout = config
                .tile_layout
                .get_or_insert_with(|| TileLayout::uniform(&frame.sequence, columns, 1))
                .clone();
            frame = frame.with_slices(layout.slices().unwrap());
        }

        let feature_set = FeatureSet::new(&config, &settings, memory.as_ref()).unwrap();
        let features = feature_set.evaluate(&frame).unwrap();
        let scalability = Scalability::new(&settings, vdbox, memory.as_ref()).unwrap();
        let num_pipes = scalability.num_pipes(features.tiles.as_ref());
        let slot = SlotResources::allocate(memory.as_ref(), 0, settings.max_brc_passes).unwrap();
        let mut status = StatusReport::new(memory.clone()).unwrap();
        let report = status.begin(frame.seq, SlotIndex(0), slot.status_record).unwrap();
        let brc_history = feature_set.brc().unwrap().history_address();
        let lookahead_stats = features.lookahead.and_then(|decision| {
            feature_set
                .lookahead()
                .map(|la| la.stats_address(decision.stats_entry))
        });

        Self {
            memory,
            settings,
            frame,
            features,
            slot,
            report,
            scalability,
            brc_history,
            lookahead_stats,
            num_pipes,
            status,
        }
    }

    pub fn context(&self, pass: u8, pipe: u8) -> BuildContext<'_> {
        BuildContext {
            frame: &self.frame,
            features: &self.features,
            pass: PassContext {
                index: pass,
                num_passes: self.features.num_passes(),
            },
            pipe: PipeContext::new(pipe, self.num_pipes),
            slot: &self.slot,
            report: &self.report,
            scalability: &self.scalability,
            memory: self.memory.as_ref(),
            settings: &self.settings,
            brc_history: self.brc_history,
            lookahead_stats: self.lookahead_stats,
            first_in_phase: true,
            batching: true,
        }
    }

    pub fn build(&self, pkt: &mut dyn EncodePacket, pass: u8, pipe: u8) -> Result<CommandBuffer> {
        let mut cb = CommandBuffer::with_capacity(self.settings.command_buffer_dwords);
        pkt.build(&self.context(pass, pipe), &mut cb)?;
        Ok(cb)
    }

    pub fn completion<'a>(&'a self, record: &'a StatusRecord) -> CompletionContext<'a> {
        CompletionContext {
            features: &self.features,
            num_pipes: self.num_pipes,
            slot: &self.slot,
            record,
            memory: self.memory.as_ref(),
            settings: &self.settings,
        }
    }
}

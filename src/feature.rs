use std::collections::BTreeMap;

use tracing::debug;

use crate::brc::{BrcDecision, BrcFeature};
use crate::contract::{
    EncodeFrame, FeatureConfig, MAX_ROI_REGIONS, OrchestrationError, PictureType, Result,
    RoiRegion,
};
use crate::platform::PlatformSettings;
use crate::resource::{GpuAddress, MemoryServices, ResourceHandle, ResourceSpec};
use crate::status::StatusReportData;
use crate::tile::{TileFeature, TileGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureTag {
    Brc,
    Tile,
    Lookahead,
    Roi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookaheadDecision {
    pub depth: u32,
    pub adaptive_intra: bool,
    pub forced_intra: bool,
    pub stats_entry: u32,
}

#[derive(Debug)]
pub struct LookaheadFeature {
    depth: u32,
    adaptive_intra: bool,
    max_intra_interval: u32,
    stats: ResourceHandle,
    /// Entries the stats buffer was allocated for.
    capacity: u32,
    frames_since_intra: u32,
}

impl LookaheadFeature {
    pub fn new(config: &FeatureConfig, memory: &dyn MemoryServices) -> Result<Self> {
        let capacity = config.lookahead_depth.max(1);
        let stats = memory.allocate(&ResourceSpec::new(
            "lookahead_stats",
            capacity as usize * 4,
        ))?;
        Ok(Self {
            depth: config.lookahead_depth,
            adaptive_intra: config.lookahead_adaptive_intra,
            max_intra_interval: config.max_adaptive_gop,
            stats,
            capacity,
            frames_since_intra: 0,
        })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn fits(&self, depth: u32) -> bool {
        depth > 0 && depth <= self.capacity
    }

    fn reconfigure(&mut self, config: &FeatureConfig) {
        self.depth = config.lookahead_depth;
        self.adaptive_intra = config.lookahead_adaptive_intra;
        self.max_intra_interval = config.max_adaptive_gop;
    }

    pub fn evaluate(&self, frame: &EncodeFrame) -> LookaheadDecision {
        let forced_intra = self.adaptive_intra
            && frame.picture_type != PictureType::I
            && self.max_intra_interval > 0
            && self.frames_since_intra + 1 >= self.max_intra_interval;
        LookaheadDecision {
            depth: self.depth,
            adaptive_intra: self.adaptive_intra,
            forced_intra,
            stats_entry: frame.seq.0 % self.depth.max(1),
        }
    }

    pub fn commit(&mut self, frame: &EncodeFrame, decision: &LookaheadDecision) {
        if frame.picture_type == PictureType::I || decision.forced_intra {
            self.frames_since_intra = 0;
        } else {
            self.frames_since_intra += 1;
        }
    }

    pub fn stats_address(&self, entry: u32) -> GpuAddress {
        GpuAddress::new(self.stats, entry * 4)
    }
}

#[derive(Debug, Clone)]
pub struct RoiFeature {
    regions: Vec<RoiRegion>,
}

impl RoiFeature {
    pub fn new(config: &FeatureConfig) -> Result<Self> {
        if config.roi_regions.len() > MAX_ROI_REGIONS {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{} roi regions exceed {MAX_ROI_REGIONS}",
                config.roi_regions.len()
            )));
        }
        Ok(Self {
            regions: config.roi_regions.clone(),
        })
    }

    pub fn evaluate(&self, frame: &EncodeFrame) -> Result<u8> {
        let width = frame.sequence.dims.width.get();
        let height = frame.sequence.dims.height.get();
        if let Some(bad) = self.regions.iter().find(|r| {
            r.left >= r.right || r.top >= r.bottom || r.right > width || r.bottom > height
        }) {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "roi region {bad:?} outside {width}x{height}"
            )));
        }
        Ok(self.regions.len() as u8)
    }
}

#[derive(Debug)]
pub enum Feature {
    Brc(BrcFeature),
    Tile(TileFeature),
    Lookahead(LookaheadFeature),
    Roi(RoiFeature),
}

/// Everything the features decided for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFeatures {
    pub brc: BrcDecision,
    pub tiles: Option<TileGrid>,
    pub lookahead: Option<LookaheadDecision>,
    pub roi_count: u8,
    pub picture_type: PictureType,
}

impl FrameFeatures {
    pub fn num_passes(&self) -> u8 {
        self.brc.num_passes
    }

    pub fn is_last_pass(&self, pass: u8) -> bool {
        pass + 1 == self.brc.num_passes
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.as_ref().map_or(1, TileGrid::len)
    }

    /// Whether `pass` is guarded by the firmware convergence predicate.
    pub fn is_conditional(&self, pass: u8) -> bool {
        if pass == 0 {
            return false;
        }
        match self.lookahead {
            Some(la) if la.adaptive_intra && self.picture_type != PictureType::I => {
                self.is_last_pass(pass)
            }
            _ => true,
        }
    }

    pub fn stream_in(&self, pass: u8) -> bool {
        if self.roi_count > 0 {
            return true;
        }
        match self.lookahead {
            Some(la) => {
                (pass != 0 && self.is_last_pass(pass))
                    || (la.forced_intra && self.picture_type != PictureType::I)
            }
            None => false,
        }
    }
}

/// Typed feature registry, populated once at pipeline construction.
#[derive(Debug)]
pub struct FeatureSet {
    config: FeatureConfig,
    features: BTreeMap<FeatureTag, Feature>,
    /// Replaced buffers that frames already submitted may still write.
    retired: Vec<ResourceHandle>,
}

impl FeatureSet {
    pub fn new(
        config: &FeatureConfig,
        settings: &PlatformSettings,
        memory: &dyn MemoryServices,
    ) -> Result<Self> {
        let mut features = BTreeMap::new();
        features.insert(
            FeatureTag::Brc,
            Feature::Brc(BrcFeature::new(config, settings, memory)?),
        );
        features.insert(
            FeatureTag::Tile,
            Feature::Tile(TileFeature::new(config, settings.max_tile_columns)),
        );
        if config.lookahead_depth > 0 {
            features.insert(
                FeatureTag::Lookahead,
                Feature::Lookahead(LookaheadFeature::new(config, memory)?),
            );
        }
        if !config.roi_regions.is_empty() {
            features.insert(FeatureTag::Roi, Feature::Roi(RoiFeature::new(config)?));
        }
        debug!(%config, tags = ?features.keys().collect::<Vec<_>>(), "feature set built");
        Ok(Self {
            config: config.clone(),
            features,
            retired: Vec::new(),
        })
    }

    /// Swaps the per-frame configuration while keeping BRC history, so a mode
    /// change is seen as such on the next frame.
    pub fn reconfigure(
        &mut self,
        config: &FeatureConfig,
        settings: &PlatformSettings,
        memory: &dyn MemoryServices,
    ) -> Result<()> {
        let roi = if config.roi_regions.is_empty() {
            None
        } else {
            Some(RoiFeature::new(config)?)
        };
        // A stats buffer that is large enough keeps serving the new depth.
        let reuse = self
            .lookahead()
            .is_some_and(|la| la.fits(config.lookahead_depth));
        let fresh = if config.lookahead_depth > 0 && !reuse {
            Some(LookaheadFeature::new(config, memory)?)
        } else {
            None
        };

        if let Some(Feature::Brc(brc)) = self.features.get_mut(&FeatureTag::Brc) {
            brc.reconfigure(config);
        }
        self.features.insert(
            FeatureTag::Tile,
            Feature::Tile(TileFeature::new(config, settings.max_tile_columns)),
        );
        let previous = match self.features.remove(&FeatureTag::Lookahead) {
            Some(Feature::Lookahead(la)) => Some(la),
            _ => None,
        };
        match (previous, fresh) {
            (Some(mut la), None) if reuse => {
                la.reconfigure(config);
                self.features.insert(FeatureTag::Lookahead, Feature::Lookahead(la));
            }
            (previous, fresh) => {
                if let Some(old) = previous {
                    debug!(resource = %old.stats, "lookahead stats buffer retired");
                    self.retired.push(old.stats);
                }
                if let Some(la) = fresh {
                    self.features.insert(FeatureTag::Lookahead, Feature::Lookahead(la));
                }
            }
        }
        self.features.remove(&FeatureTag::Roi);
        if let Some(roi) = roi {
            self.features.insert(FeatureTag::Roi, Feature::Roi(roi));
        }
        self.config = config.clone();
        Ok(())
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn retired_resources(&self) -> usize {
        self.retired.len()
    }

    /// Frees buffers dropped by `reconfigure`. Only sound once no frame
    /// submitted before the reconfiguration is still in flight.
    pub fn release_retired(&mut self, memory: &dyn MemoryServices) -> Result<()> {
        while let Some(handle) = self.retired.pop() {
            memory.free(handle)?;
        }
        Ok(())
    }

    pub fn get(&self, tag: FeatureTag) -> Option<&Feature> {
        self.features.get(&tag)
    }

    pub fn contains(&self, tag: FeatureTag) -> bool {
        self.features.contains_key(&tag)
    }

    pub fn brc(&self) -> Result<&BrcFeature> {
        match self.features.get(&FeatureTag::Brc) {
            Some(Feature::Brc(brc)) => Ok(brc),
            _ => Err(OrchestrationError::NullDependency(
                "brc feature not registered".to_string(),
            )),
        }
    }

    fn brc_mut(&mut self) -> Option<&mut BrcFeature> {
        match self.features.get_mut(&FeatureTag::Brc) {
            Some(Feature::Brc(brc)) => Some(brc),
            _ => None,
        }
    }

    pub fn tile(&self) -> Option<&TileFeature> {
        match self.features.get(&FeatureTag::Tile) {
            Some(Feature::Tile(tile)) => Some(tile),
            _ => None,
        }
    }

    pub fn lookahead(&self) -> Option<&LookaheadFeature> {
        match self.features.get(&FeatureTag::Lookahead) {
            Some(Feature::Lookahead(la)) => Some(la),
            _ => None,
        }
    }

    pub fn roi(&self) -> Option<&RoiFeature> {
        match self.features.get(&FeatureTag::Roi) {
            Some(Feature::Roi(roi)) => Some(roi),
            _ => None,
        }
    }

    pub fn evaluate(&self, frame: &EncodeFrame) -> Result<FrameFeatures> {
        frame.sequence.lcu_count()?;
        let brc = self.brc()?.evaluate(frame)?;
        let tiles = match self.tile() {
            Some(tile) => tile.evaluate(frame)?,
            None => None,
        };
        let lookahead = self.lookahead().map(|la| la.evaluate(frame));
        let roi_count = match self.roi() {
            Some(roi) => roi.evaluate(frame)?,
            None => 0,
        };
        Ok(FrameFeatures {
            brc,
            tiles,
            lookahead,
            roi_count,
            picture_type: frame.picture_type,
        })
    }

    /// Applies the state changes implied by a frame that was submitted.
    pub fn commit(&mut self, frame: &EncodeFrame, decided: &FrameFeatures) {
        if let Some(brc) = self.brc_mut() {
            brc.commit(frame, &decided.brc);
        }
        if let (Some(Feature::Lookahead(la)), Some(decision)) = (
            self.features.get_mut(&FeatureTag::Lookahead),
            decided.lookahead.as_ref(),
        ) {
            la.commit(frame, decision);
        }
    }

    pub fn on_frame_completed(&mut self, report: &StatusReportData) {
        if let Some(brc) = self.brc_mut() {
            if brc.mode().uses_firmware() {
                brc.record_convergence(report.passes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Dimensions, FrameSeq, RateControlMode, SequenceParams};
    use crate::resource::HostMemory;

    fn frame(picture_type: PictureType) -> EncodeFrame {
        let seq = SequenceParams::for_dims(Dimensions::new(1280, 720).unwrap());
        EncodeFrame::new(FrameSeq(0), picture_type, seq)
    }

    fn set(config: FeatureConfig) -> FeatureSet {
        FeatureSet::new(&config, &PlatformSettings::default(), &HostMemory::new()).unwrap()
    }

    #[test]
    fn registry_holds_configured_features() {
        let fs = set(FeatureConfig {
            lookahead_depth: 4,
            ..FeatureConfig::default()
        });
        assert!(fs.contains(FeatureTag::Brc));
        assert!(fs.contains(FeatureTag::Tile));
        assert!(fs.contains(FeatureTag::Lookahead));
        assert!(!fs.contains(FeatureTag::Roi));
        assert!(matches!(fs.get(FeatureTag::Brc), Some(Feature::Brc(_))));
    }

    #[test]
    fn adaptive_intra_keeps_non_final_passes_unconditional() {
        let fs = set(FeatureConfig {
            rate_control_mode: RateControlMode::Vbr,
            max_brc_passes: 3,
            lookahead_depth: 4,
            lookahead_adaptive_intra: true,
            ..FeatureConfig::default()
        });
        let p = fs.evaluate(&frame(PictureType::P)).unwrap();
        assert!(!p.is_conditional(0));
        assert!(!p.is_conditional(1));
        assert!(p.is_conditional(2));

        let i = fs.evaluate(&frame(PictureType::I)).unwrap();
        assert!(i.is_conditional(1));
    }

    #[test]
    fn stream_in_on_final_pass_with_lookahead() {
        let fs = set(FeatureConfig {
            rate_control_mode: RateControlMode::Cbr,
            max_brc_passes: 2,
            lookahead_depth: 2,
            ..FeatureConfig::default()
        });
        let decided = fs.evaluate(&frame(PictureType::P)).unwrap();
        assert!(!decided.stream_in(0));
        assert!(decided.stream_in(1));
    }

    #[test]
    fn roi_forces_stream_in_and_is_bounded() {
        let region = RoiRegion {
            left: 0,
            top: 0,
            right: 64,
            bottom: 64,
            priority: 2,
        };
        let fs = set(FeatureConfig {
            roi_regions: vec![region; 3],
            ..FeatureConfig::default()
        });
        let decided = fs.evaluate(&frame(PictureType::P)).unwrap();
        assert_eq!(decided.roi_count, 3);
        assert!(decided.stream_in(0));

        let too_many = FeatureConfig {
            roi_regions: vec![region; MAX_ROI_REGIONS + 1],
            ..FeatureConfig::default()
        };
        assert!(FeatureSet::new(&too_many, &PlatformSettings::default(), &HostMemory::new()).is_err());
    }

    #[test]
    fn roi_outside_frame_is_rejected() {
        let fs = set(FeatureConfig {
            roi_regions: vec![RoiRegion {
                left: 0,
                top: 0,
                right: 4096,
                bottom: 64,
                priority: 1,
            }],
            ..FeatureConfig::default()
        });
        assert!(fs.evaluate(&frame(PictureType::P)).is_err());
    }

    #[test]
    fn forced_intra_after_interval() {
        let memory = HostMemory::new();
        let config = FeatureConfig {
            lookahead_depth: 2,
            lookahead_adaptive_intra: true,
            max_adaptive_gop: 3,
            ..FeatureConfig::default()
        };
        let mut la = LookaheadFeature::new(&config, &memory).unwrap();
        let p = frame(PictureType::P);
        let mut forced = Vec::new();
        for _ in 0..4 {
            let decision = la.evaluate(&p);
            forced.push(decision.forced_intra);
            la.commit(&p, &decision);
        }
        assert_eq!(forced, vec![false, false, true, false]);
    }

    #[test]
    fn mode_change_requires_init() {
        let memory = HostMemory::new();
        let settings = PlatformSettings::default();
        let mut fs = FeatureSet::new(
            &FeatureConfig {
                rate_control_mode: RateControlMode::Cbr,
                ..FeatureConfig::default()
            },
            &settings,
            &memory,
        )
        .unwrap();
        let f = frame(PictureType::P);
        let decided = fs.evaluate(&f).unwrap();
        fs.commit(&f, &decided);
        assert!(!fs.evaluate(&f).unwrap().brc.init_required);

        let vbr = FeatureConfig {
            rate_control_mode: RateControlMode::Vbr,
            ..FeatureConfig::default()
        };
        fs.reconfigure(&vbr, &settings, &memory).unwrap();
        assert!(fs.evaluate(&f).unwrap().brc.init_required);
    }

    #[test]
    fn oversized_frames_are_rejected_before_planning() {
        let fs = set(FeatureConfig::default());
        let mut seq = SequenceParams::for_dims(Dimensions::new(u32::MAX, 1 << 20).unwrap());
        seq.lcu_size = 16;
        let f = EncodeFrame::new(FrameSeq(0), PictureType::I, seq);
        let err = fs.evaluate(&f).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
    }

    #[test]
    fn lookahead_depth_changes_do_not_leak_stats_buffers() {
        let settings = PlatformSettings::default();
        let memory = HostMemory::new();
        let depth = |lookahead_depth| FeatureConfig {
            lookahead_depth,
            ..FeatureConfig::default()
        };
        let mut fs = FeatureSet::new(&depth(8), &settings, &memory).unwrap();
        let baseline = memory.resource_count();

        // Shrinking stays inside the existing buffer.
        fs.reconfigure(&depth(4), &settings, &memory).unwrap();
        assert_eq!(fs.lookahead().unwrap().depth(), 4);
        assert_eq!(fs.retired_resources(), 0);
        assert_eq!(memory.resource_count(), baseline);

        fs.reconfigure(&depth(16), &settings, &memory).unwrap();
        assert_eq!(fs.retired_resources(), 1);
        fs.reconfigure(&depth(0), &settings, &memory).unwrap();
        assert!(fs.lookahead().is_none());
        assert_eq!(fs.retired_resources(), 2);

        fs.release_retired(&memory).unwrap();
        assert_eq!(fs.retired_resources(), 0);
        assert_eq!(memory.resource_count(), baseline - 1);

        for round in 1..=5 {
            fs.reconfigure(&depth(8 * round), &settings, &memory).unwrap();
            fs.release_retired(&memory).unwrap();
        }
        assert_eq!(memory.resource_count(), baseline);
    }
}

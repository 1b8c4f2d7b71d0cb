use crate::command::TileCoding;
use crate::contract::{EncodeFrame, FeatureConfig, OrchestrationError, Result, TileLayout};
use crate::ring::MAX_TILES;

/// One tile of the frame. LCU coordinates are in units of the sequence LCU
/// size, pixel extents are clipped to the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub index: u32,
    pub column: u32,
    pub row: u32,
    pub lcu_x: u32,
    pub lcu_y: u32,
    pub width_lcu: u32,
    pub height_lcu: u32,
    pub pixel_x: u32,
    pub pixel_y: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// First LCU of this tile in tile-scan order.
    pub scan_start: u32,
    pub last_in_row: bool,
    pub last_in_frame: bool,
}

impl TileInfo {
    pub fn lcu_count(&self) -> u32 {
        self.width_lcu * self.height_lcu
    }

    pub fn contains_slice(&self, start_lcu: u32, num_lcus: u32) -> bool {
        start_lcu >= self.scan_start
            && start_lcu
                .checked_add(num_lcus)
                .is_some_and(|end| end <= self.scan_start + self.lcu_count())
    }

    pub fn coding(&self) -> TileCoding {
        TileCoding {
            column: self.column,
            row: self.row,
            index: self.index,
            lcu_count: self.lcu_count(),
            last_in_row: self.last_in_row,
            last_in_frame: self.last_in_frame,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    columns: u32,
    rows: u32,
    tiles: Vec<TileInfo>,
    /// Slice index carried by each tile.
    slice_of_tile: Vec<Option<usize>>,
}

impl TileGrid {
    pub fn build(frame: &EncodeFrame, layout: &TileLayout) -> Result<Self> {
        let seq = &frame.sequence;
        let invalid = |msg: String| OrchestrationError::InvalidConfiguration(msg);

        if layout.column_widths_lcu.is_empty() || layout.row_heights_lcu.is_empty() {
            return Err(invalid("tile layout has no columns or rows".to_string()));
        }
        if layout
            .column_widths_lcu
            .iter()
            .chain(&layout.row_heights_lcu)
            .any(|v| *v == 0)
        {
            return Err(invalid("tile layout has an empty column or row".to_string()));
        }
        // Tiles are bounded by the frame once the sums match and the frame count fits.
        seq.lcu_count()?;
        let sum = |sizes: &[u32]| sizes.iter().try_fold(0u32, |acc, v| acc.checked_add(*v));
        let (Some(width_lcu), Some(height_lcu)) = (
            sum(&layout.column_widths_lcu),
            sum(&layout.row_heights_lcu),
        ) else {
            return Err(invalid("tile layout sizes overflow".to_string()));
        };
        if width_lcu != seq.width_in_lcu() || height_lcu != seq.height_in_lcu() {
            return Err(invalid(format!(
                "tile layout covers {width_lcu}x{height_lcu} lcus, frame is {}x{}",
                seq.width_in_lcu(),
                seq.height_in_lcu()
            )));
        }
        let columns = layout.num_columns() as u32;
        let rows = layout.num_rows() as u32;
        if layout.num_columns().saturating_mul(layout.num_rows()) > MAX_TILES {
            return Err(invalid(format!("{columns}x{rows} tiles exceed {MAX_TILES}")));
        }

        let lcu = seq.lcu_size;
        let frame_w = seq.dims.width.get();
        let frame_h = seq.dims.height.get();
        let mut tiles = Vec::with_capacity((columns * rows) as usize);
        let mut scan_start = 0;
        let mut lcu_y = 0;
        for (row, height) in layout.row_heights_lcu.iter().enumerate() {
            let mut lcu_x = 0;
            for (column, width) in layout.column_widths_lcu.iter().enumerate() {
                let pixel_x = lcu_x * lcu;
                let pixel_y = lcu_y * lcu;
                let tile = TileInfo {
                    index: tiles.len() as u32,
                    column: column as u32,
                    row: row as u32,
                    lcu_x,
                    lcu_y,
                    width_lcu: *width,
                    height_lcu: *height,
                    pixel_x,
                    pixel_y,
                    pixel_width: width.saturating_mul(lcu).min(frame_w - pixel_x),
                    pixel_height: height.saturating_mul(lcu).min(frame_h - pixel_y),
                    scan_start,
                    last_in_row: column as u32 + 1 == columns,
                    last_in_frame: column as u32 + 1 == columns && row as u32 + 1 == rows,
                };
                scan_start += tile.lcu_count();
                tiles.push(tile);
                lcu_x += width;
            }
            lcu_y += height;
        }

        let mut slice_of_tile = vec![None; tiles.len()];
        for (slice_index, slice) in frame.slices.iter().enumerate() {
            let tile = tiles
                .iter()
                .find(|t| t.contains_slice(slice.start_lcu, slice.num_lcus))
                .ok_or_else(|| {
                    invalid(format!(
                        "slice {slice_index} (lcus {}+{}) crosses a tile boundary",
                        slice.start_lcu, slice.num_lcus
                    ))
                })?;
            let owner = &mut slice_of_tile[tile.index as usize];
            if owner.is_some() {
                return Err(invalid(format!(
                    "multiple slices inside tile {} are not supported",
                    tile.index
                )));
            }
            *owner = Some(slice_index);
        }
        if let Some(empty) = slice_of_tile.iter().position(Option::is_none) {
            return Err(invalid(format!("tile {empty} carries no slice")));
        }

        Ok(Self {
            columns,
            rows,
            tiles,
            slice_of_tile,
        })
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[TileInfo] {
        &self.tiles
    }

    pub fn slice_of(&self, tile: &TileInfo) -> Option<usize> {
        self.slice_of_tile.get(tile.index as usize).copied().flatten()
    }

    /// Pipe that encodes `tile`: its column when every column has a pipe,
    /// otherwise the single pipe.
    pub fn pipe_for(&self, tile: &TileInfo, num_pipes: u8) -> u8 {
        if u32::from(num_pipes) == self.columns {
            tile.column as u8
        } else {
            0
        }
    }

    pub fn tiles_for_pipe(&self, pipe: u8, num_pipes: u8) -> impl Iterator<Item = &TileInfo> + '_ {
        self.tiles
            .iter()
            .filter(move |t| self.pipe_for(t, num_pipes) == pipe)
    }
}

#[derive(Debug, Clone)]
pub struct TileFeature {
    enabled: bool,
    layout: Option<TileLayout>,
    max_columns: u32,
}

impl TileFeature {
    pub fn new(config: &FeatureConfig, max_columns: u32) -> Self {
        Self {
            enabled: config.tiling_enabled,
            layout: config.tile_layout.clone(),
            max_columns,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn evaluate(&self, frame: &EncodeFrame) -> Result<Option<TileGrid>> {
        if !self.enabled {
            return Ok(None);
        }
        let layout = self.layout.as_ref().ok_or_else(|| {
            OrchestrationError::InvalidConfiguration(
                "tiling enabled without a tile layout".to_string(),
            )
        })?;
        if layout.num_columns() as u32 > self.max_columns {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{} tile columns exceed platform limit {}",
                layout.num_columns(),
                self.max_columns
            )));
        }
        TileGrid::build(frame, layout).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Dimensions, FrameSeq, PictureType, SequenceParams, SliceParams};

    fn tiled_frame(columns: u32, rows: u32) -> (EncodeFrame, TileLayout) {
        let seq = SequenceParams::for_dims(Dimensions::new(1920, 1080).unwrap());
        let layout = TileLayout::uniform(&seq, columns, rows);
        let frame =
            EncodeFrame::new(FrameSeq(0), PictureType::I, seq).with_slices(layout.slices().unwrap());
        (frame, layout)
    }

    #[test]
    fn grid_flags_and_extents() {
        let (frame, layout) = tiled_frame(2, 2);
        let grid = TileGrid::build(&frame, &layout).unwrap();
        assert_eq!(grid.len(), 4);
        let last = grid.tiles()[3];
        assert!(last.last_in_row && last.last_in_frame);
        assert!(grid.tiles()[1].last_in_row && !grid.tiles()[1].last_in_frame);
        assert!(!grid.tiles()[0].last_in_row);
        assert_eq!(last.pixel_x + last.pixel_width, 1920);
        assert_eq!(last.pixel_y + last.pixel_height, 1080);
    }

    #[test]
    fn two_pipes_split_by_column() {
        let (frame, layout) = tiled_frame(2, 3);
        let grid = TileGrid::build(&frame, &layout).unwrap();
        let pipe1: Vec<_> = grid.tiles_for_pipe(1, 2).map(|t| t.column).collect();
        assert_eq!(pipe1, vec![1, 1, 1]);
        assert_eq!(grid.tiles_for_pipe(0, 1).count(), 6);
    }

    #[test]
    fn slice_crossing_tiles_is_rejected() {
        let (frame, layout) = tiled_frame(2, 1);
        let whole = frame.clone().with_slices(vec![SliceParams {
            start_lcu: 0,
            num_lcus: frame.sequence.lcu_count().unwrap(),
        }]);
        let err = TileGrid::build(&whole, &layout).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
    }

    #[test]
    fn multiple_slices_in_one_tile_are_rejected() {
        let (frame, layout) = tiled_frame(2, 1);
        let first = layout.slices().unwrap()[0];
        let split = frame.with_slices(vec![
            SliceParams {
                start_lcu: 0,
                num_lcus: 1,
            },
            SliceParams {
                start_lcu: 1,
                num_lcus: first.num_lcus - 1,
            },
        ]);
        assert!(TileGrid::build(&split, &layout).is_err());
    }

    #[test]
    fn layout_must_cover_frame() {
        let (frame, mut layout) = tiled_frame(2, 1);
        layout.column_widths_lcu[0] -= 1;
        assert!(TileGrid::build(&frame, &layout).is_err());
    }

    #[test]
    fn disabled_feature_yields_no_grid() {
        let (frame, _) = tiled_frame(2, 1);
        let feature = TileFeature::new(&FeatureConfig::default(), 20);
        assert_eq!(feature.evaluate(&frame).unwrap(), None);
    }
}

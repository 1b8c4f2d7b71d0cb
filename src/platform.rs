use std::fmt;

use serde::{Deserialize, Serialize};

/// Silicon generation the command stream is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Gen11,
    #[default]
    Gen12,
    Xe2,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gen11 => f.write_str("gen11"),
            Self::Gen12 => f.write_str("gen12"),
            Self::Xe2 => f.write_str("xe2"),
        }
    }
}

/// Immutable per-generation constants, selected once at pipeline construction
/// and passed by reference afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformSettings {
    pub platform: Platform,
    pub max_vdbox: u8,
    /// Dummy stores emitted between the all-pipes wait and the decrement.
    pub semaphore_delay_count: u32,
    pub command_buffer_dwords: usize,
    pub max_brc_passes: u8,
    pub ring_depth: usize,
    /// Bit the BRC firmware sets in HUC_STATUS when another pass is needed.
    pub huc_reencode_mask: u32,
    /// HUC_STATUS2 bit reporting a loaded and authenticated firmware image.
    pub huc_auth_ok_mask: u32,
    pub max_tile_columns: u32,
}

impl PlatformSettings {
    pub const fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Gen11 => Self {
                platform,
                max_vdbox: 2,
                semaphore_delay_count: 20,
                command_buffer_dwords: 16 * 1024,
                max_brc_passes: 4,
                ring_depth: 6,
                huc_reencode_mask: 0x8000_0000,
                huc_auth_ok_mask: 0x40,
                max_tile_columns: 20,
            },
            Platform::Gen12 => Self {
                platform,
                max_vdbox: 4,
                semaphore_delay_count: 20,
                command_buffer_dwords: 32 * 1024,
                max_brc_passes: 4,
                ring_depth: 6,
                huc_reencode_mask: 0x8000_0000,
                huc_auth_ok_mask: 0x40,
                max_tile_columns: 20,
            },
            Platform::Xe2 => Self {
                platform,
                max_vdbox: 4,
                semaphore_delay_count: 8,
                command_buffer_dwords: 64 * 1024,
                max_brc_passes: 4,
                ring_depth: 6,
                huc_reencode_mask: 0x8000_0000,
                huc_auth_ok_mask: 0x40,
                max_tile_columns: 20,
            },
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self::for_platform(Platform::default())
    }
}

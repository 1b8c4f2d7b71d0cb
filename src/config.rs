use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contract::{OrchestrationError, Result};
use crate::platform::{Platform, PlatformSettings};

pub const ENV_SINGLE_TASK_PHASE: &str = "VDENC_PIPELINE_SINGLE_TASK_PHASE";
pub const ENV_METRICS: &str = "VDENC_PIPELINE_METRICS";

const DEFAULT_HAZARD_WAIT_MS: u64 = 2_000;

/// Driver-level options. Every field is an optional override; unset fields
/// fall back to the selected platform's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub platform: Option<Platform>,
    pub single_task_phase: Option<bool>,
    pub ring_depth: Option<usize>,
    pub vdbox_count: Option<u8>,
    pub metrics: Option<bool>,
    pub hazard_wait_ms: Option<u64>,
}

/// Configuration after defaults and environment overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub settings: PlatformSettings,
    pub single_task_phase: bool,
    pub ring_depth: usize,
    pub vdbox_count: u8,
    pub metrics: bool,
    pub hazard_wait: Duration,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let settings = PlatformSettings::default();
        Self {
            settings,
            single_task_phase: true,
            ring_depth: settings.ring_depth,
            vdbox_count: settings.max_vdbox,
            metrics: false,
            hazard_wait: Duration::from_millis(DEFAULT_HAZARD_WAIT_MS),
        }
    }
}

impl DriverConfig {
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(&self, env: F) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = PlatformSettings::for_platform(self.platform.unwrap_or_default());

        let ring_depth = self.ring_depth.unwrap_or(settings.ring_depth);
        if !(1..=64).contains(&ring_depth) {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "ring depth {ring_depth} outside 1..=64"
            )));
        }

        let vdbox_count = self.vdbox_count.unwrap_or(settings.max_vdbox);
        if vdbox_count == 0 || vdbox_count > settings.max_vdbox {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "vdbox count {vdbox_count} not supported on {} (max {})",
                settings.platform, settings.max_vdbox
            )));
        }

        let single_task_phase = env(ENV_SINGLE_TASK_PHASE)
            .and_then(|v| parse_flag(&v))
            .or(self.single_task_phase)
            .unwrap_or(true);
        let metrics = env(ENV_METRICS)
            .and_then(|v| parse_flag(&v))
            .or(self.metrics)
            .unwrap_or(false);

        Ok(ResolvedConfig {
            settings,
            single_task_phase,
            ring_depth,
            vdbox_count,
            metrics,
            hazard_wait: Duration::from_millis(
                self.hazard_wait_ms.unwrap_or(DEFAULT_HAZARD_WAIT_MS),
            ),
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    let value = value.trim();
    if value == "1" || value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value == "0" || value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for `max_pcons`; ids are `u32` and the table is allocated eagerly.
const MAX_PCON_TABLE_SLOTS: usize = 1 << 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid config field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Tunables for a [`crate::Vcrtcm`] instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcrtcmConfig {
    pub max_pcons: usize,
    pub max_minors: u32,
    pub page_size: usize,
    pub max_fb_width: u32,
    pub max_fb_height: u32,
    pub max_cursor_width: u32,
    pub max_cursor_height: u32,
    pub max_fps: u32,
    /// Transmit even without a dirty/force request when nothing was sent for this long.
    pub xmit_hard_deadline_ms: u64,
    /// Vblank deadlines that are less than this far in the future fire on the current tick.
    pub vblank_slack_us: u64,
    /// After a long stall at most this many vblanks are emulated in one tick; the schedule is
    /// then resynchronised to the current time.
    pub max_catchup_vblanks: u32,
}

impl Default for VcrtcmConfig {
    fn default() -> Self {
        Self {
            max_pcons: 1024,
            max_minors: 64,
            page_size: 4096,
            max_fb_width: 4096,
            max_fb_height: 4096,
            max_cursor_width: 64,
            max_cursor_height: 64,
            max_fps: 240,
            xmit_hard_deadline_ms: 1000,
            vblank_slack_us: 1000,
            max_catchup_vblanks: 16,
        }
    }
}

impl VcrtcmConfig {
    /// Defaults overlaid with any `VCRTCM_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = parse_env("VCRTCM_MAX_PCONS")? {
            cfg.max_pcons = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_MINORS")? {
            cfg.max_minors = v;
        }
        if let Some(v) = parse_env("VCRTCM_PAGE_SIZE")? {
            cfg.page_size = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_FB_WIDTH")? {
            cfg.max_fb_width = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_FB_HEIGHT")? {
            cfg.max_fb_height = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_CURSOR_WIDTH")? {
            cfg.max_cursor_width = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_CURSOR_HEIGHT")? {
            cfg.max_cursor_height = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_FPS")? {
            cfg.max_fps = v;
        }
        if let Some(v) = parse_env("VCRTCM_XMIT_HARD_DEADLINE_MS")? {
            cfg.xmit_hard_deadline_ms = v;
        }
        if let Some(v) = parse_env("VCRTCM_VBLANK_SLACK_US")? {
            cfg.vblank_slack_us = v;
        }
        if let Some(v) = parse_env("VCRTCM_MAX_CATCHUP_VBLANKS")? {
            cfg.max_catchup_vblanks = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pcons == 0 || self.max_pcons > MAX_PCON_TABLE_SLOTS {
            return Err(ConfigError::InvalidField {
                field: "max_pcons",
                reason: "must be in 1..=65536",
            });
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::InvalidField {
                field: "page_size",
                reason: "must be a non-zero power of two",
            });
        }
        if self.max_fb_width == 0 || self.max_fb_height == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_fb_width/max_fb_height",
                reason: "must be non-zero",
            });
        }
        if self.max_cursor_width == 0 || self.max_cursor_height == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_cursor_width/max_cursor_height",
                reason: "must be non-zero",
            });
        }
        if self.max_fps == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_fps",
                reason: "must be non-zero",
            });
        }
        if self.max_catchup_vblanks == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_catchup_vblanks",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }

    pub(crate) fn xmit_hard_deadline_ns(&self) -> u64 {
        self.xmit_hard_deadline_ms.saturating_mul(1_000_000)
    }

    pub(crate) fn vblank_slack_ns(&self) -> u64 {
        self.vblank_slack_us.saturating_mul(1_000)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(var)),
        Err(_) => Ok(None),
    }
}

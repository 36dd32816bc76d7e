//! Session-wide defaults consumed by the region engine.
//!
//! Scaled-down cousin of a full session settings store: this crate only
//! needs the handful of values the original reads off its session object
//! when a region falls back to "default" behaviour.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fade::FadeShape;

/// Defaults applied when a region doesn't carry an explicit value of its
/// own, e.g. a freshly-created fade or a missing plugin block size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    /// Shape used by `set_default_fade_in` / `set_default_fade_out`.
    pub default_fade_shape: FadeShape,

    /// Length, in samples, of a freshly-created default fade.
    pub default_fade_length: u64,

    /// When a channel index passed to the source reader adapter exceeds the
    /// region's channel count, read `chan % n_chan` instead of silence.
    pub replicate_missing_channels: bool,

    /// Maximum frames passed to a plugin's `run` call in one sub-block.
    pub fx_block_size: usize,

    /// Global gate on region fades, independent of each region's own
    /// `fade_in_active`/`fade_out_active` flags. Mirrors the session-wide
    /// "use region fades" toggle a full session settings store would carry.
    pub region_fades_enabled: bool,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            default_fade_shape: FadeShape::Linear,
            default_fade_length: 64,
            replicate_missing_channels: true,
            fx_block_size: 1024,
            region_fades_enabled: true,
        }
    }
}

impl EngineDefaults {
    /// Load defaults from a TOML file, falling back to `Default::default()`
    /// for any field the file omits.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> crate::error::Result<Self> {
        toml::from_str(text)
            .map_err(|e| crate::error::RegionError::InvalidConfig(e.to_string()))
    }
}

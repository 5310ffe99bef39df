//! Radiance cache configuration
//!
//! Holds every knob the frame lifecycle reads: clipmap layout, slot pool
//! size, trace budget, aging and scheduling distances. Serialized to/from
//! TOML so a renderer or the `probe-sim` tool can load it from disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum number of clipmap levels
pub const MAX_CLIPMAPS: u32 = 6;

/// Maximum grid resolution per clipmap level (cells per axis)
pub const MAX_CLIPMAP_RESOLUTION: u32 = 256;

/// Maximum slot pool size (slot ids must stay below the indirection flag bits)
pub const MAX_PROBE_SLOTS: u32 = 1 << 24;

/// Maximum number of priority buckets
pub const MAX_PRIORITY_HISTOGRAM_SIZE: u32 = 4096;

/// What the cache does when the clipmap extent or distribution base changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Report the reset but keep slots and history (reprojection sorts it out)
    #[default]
    Retain,
    /// Drop every slot and all history, as on the very first frame
    Invalidate,
}

/// Radiance cache configuration.
///
/// Every field has a serde default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadianceCacheConfig {
    /// Half-width of the finest clipmap level in world units (default: 20.0)
    #[serde(default = "default_world_extent")]
    pub clipmap_world_extent: f32,
    /// Extent growth ratio between successive levels (default: 2.0)
    #[serde(default = "default_distribution_base")]
    pub clipmap_distribution_base: f32,
    /// Number of clipmap levels (default: 4, range: 1-6)
    #[serde(default = "default_num_clipmaps")]
    pub num_clipmaps: u32,
    /// Cells per axis in every level (default: 64, range: 1-256)
    #[serde(default = "default_clipmap_resolution")]
    pub clipmap_resolution: u32,
    /// Probe atlas size in probes; the slot pool holds `x * y` probes (default: 128x128)
    #[serde(default = "default_probe_atlas_resolution")]
    pub probe_atlas_resolution: [u32; 2],
    /// Maximum probes handed to the tracer per frame (default: 200)
    #[serde(default = "default_trace_budget")]
    pub num_probes_to_trace_budget: u32,
    /// Frames an unrequested probe survives before its slot is recycled (default: 3)
    #[serde(default = "default_frames_to_keep")]
    pub num_frames_to_keep_cached_probes: u32,
    /// Whether an irradiance estimate is computed alongside radiance (default: false)
    #[serde(default)]
    pub calculate_irradiance: bool,
    /// Reciprocal of the cross-level blend region size in cells (default: 1.0)
    #[serde(default = "default_inv_fade_size")]
    pub inv_clipmap_fade_size: f32,
    /// Probes farther than this are traced at reduced detail (default: 4000.0)
    #[serde(default = "default_downsample_distance")]
    pub downsample_distance_from_camera: f32,
    /// Probes closer than this are traced at increased detail (default: 300.0)
    #[serde(default = "default_supersample_distance")]
    pub supersample_distance_from_camera: f32,
    /// Number of priority buckets used by the trace scheduler (default: 128)
    #[serde(default = "default_histogram_size")]
    pub priority_histogram_size: u32,
    /// Reaction to extent/distribution-base changes (default: retain)
    #[serde(default)]
    pub reset_policy: ResetPolicy,
}

fn default_world_extent() -> f32 {
    20.0
}
fn default_distribution_base() -> f32 {
    2.0
}
fn default_num_clipmaps() -> u32 {
    4
}
fn default_clipmap_resolution() -> u32 {
    64
}
fn default_probe_atlas_resolution() -> [u32; 2] {
    [128, 128]
}
fn default_trace_budget() -> u32 {
    200
}
fn default_frames_to_keep() -> u32 {
    3
}
fn default_inv_fade_size() -> f32 {
    1.0
}
fn default_downsample_distance() -> f32 {
    4000.0
}
fn default_supersample_distance() -> f32 {
    300.0
}
fn default_histogram_size() -> u32 {
    128
}

impl Default for RadianceCacheConfig {
    fn default() -> Self {
        Self {
            clipmap_world_extent: default_world_extent(),
            clipmap_distribution_base: default_distribution_base(),
            num_clipmaps: default_num_clipmaps(),
            clipmap_resolution: default_clipmap_resolution(),
            probe_atlas_resolution: default_probe_atlas_resolution(),
            num_probes_to_trace_budget: default_trace_budget(),
            num_frames_to_keep_cached_probes: default_frames_to_keep(),
            calculate_irradiance: false,
            inv_clipmap_fade_size: default_inv_fade_size(),
            downsample_distance_from_camera: default_downsample_distance(),
            supersample_distance_from_camera: default_supersample_distance(),
            priority_histogram_size: default_histogram_size(),
            reset_policy: ResetPolicy::default(),
        }
    }
}

impl RadianceCacheConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML for
    /// this schema, or fails [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.clipmap_world_extent.is_finite() && self.clipmap_world_extent > 0.0) {
            return Err(ConfigError::InvalidWorldExtent(self.clipmap_world_extent));
        }
        if !(self.clipmap_distribution_base.is_finite() && self.clipmap_distribution_base >= 1.0) {
            return Err(ConfigError::InvalidDistributionBase(
                self.clipmap_distribution_base,
            ));
        }
        if !(1..=MAX_CLIPMAPS).contains(&self.num_clipmaps) {
            return Err(ConfigError::InvalidClipmapCount(self.num_clipmaps));
        }
        // Cell sizes are derived from twice the extent
        let coarsest = self.clipmap_world_extent
            * self
                .clipmap_distribution_base
                .powi(self.num_clipmaps as i32 - 1);
        if !(2.0 * coarsest).is_finite() {
            return Err(ConfigError::InvalidCoarsestExtent(coarsest));
        }
        if !(1..=MAX_CLIPMAP_RESOLUTION).contains(&self.clipmap_resolution) {
            return Err(ConfigError::InvalidClipmapResolution(
                self.clipmap_resolution,
            ));
        }
        let [atlas_x, atlas_y] = self.probe_atlas_resolution;
        let slots = u64::from(atlas_x) * u64::from(atlas_y);
        if slots == 0 || slots > u64::from(MAX_PROBE_SLOTS) {
            return Err(ConfigError::InvalidProbeAtlas(atlas_x, atlas_y));
        }
        if self.num_frames_to_keep_cached_probes == 0 {
            return Err(ConfigError::InvalidCachedFrames(
                self.num_frames_to_keep_cached_probes,
            ));
        }
        if !(self.inv_clipmap_fade_size.is_finite() && self.inv_clipmap_fade_size > 0.0) {
            return Err(ConfigError::InvalidFadeSize(self.inv_clipmap_fade_size));
        }
        let supersample = self.supersample_distance_from_camera;
        let downsample = self.downsample_distance_from_camera;
        if !(supersample >= 0.0 && supersample <= downsample) {
            return Err(ConfigError::InvalidTraceDistances {
                supersample,
                downsample,
            });
        }
        if !(1..=MAX_PRIORITY_HISTOGRAM_SIZE).contains(&self.priority_histogram_size) {
            return Err(ConfigError::InvalidHistogramSize(
                self.priority_histogram_size,
            ));
        }
        Ok(())
    }

    /// Slot pool capacity (atlas width x height)
    pub fn max_probe_count(&self) -> u32 {
        self.probe_atlas_resolution[0] * self.probe_atlas_resolution[1]
    }

    /// Reciprocal of the finest extent, clamped so tiny extents don't blow up scoring
    pub fn first_clipmap_world_extent_rcp(&self) -> f32 {
        1.0 / self.clipmap_world_extent.max(1.0)
    }

    /// Whether switching to `other` requires rebuilding the cell grid or slot pool
    pub fn layout_differs(&self, other: &Self) -> bool {
        self.num_clipmaps != other.num_clipmaps
            || self.clipmap_resolution != other.clipmap_resolution
            || self.probe_atlas_resolution != other.probe_atlas_resolution
            || self.priority_histogram_size != other.priority_histogram_size
    }
}

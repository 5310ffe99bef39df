//! Configuration error types
//!
//! The per-frame path never fails: allocation and budget exhaustion degrade
//! to "defer to a later frame". Errors only come from building or loading a
//! configuration.

use crate::config::{
    MAX_CLIPMAP_RESOLUTION, MAX_CLIPMAPS, MAX_PRIORITY_HISTOGRAM_SIZE, MAX_PROBE_SLOTS,
};

/// Invalid or unreadable radiance cache configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// First clipmap extent is zero, negative or not finite
    #[error("clipmap_world_extent must be positive and finite (got {0})")]
    InvalidWorldExtent(f32),

    /// Distribution base would shrink successive levels
    #[error("clipmap_distribution_base must be finite and >= 1.0 (got {0})")]
    InvalidDistributionBase(f32),

    /// Level count outside 1..=MAX_CLIPMAPS
    #[error("num_clipmaps {0} out of range (must be 1-{max})", max = MAX_CLIPMAPS)]
    InvalidClipmapCount(u32),

    /// Coarsest level is too large to represent
    #[error("coarsest clipmap extent overflows (clipmap_world_extent * base^(num_clipmaps - 1) = {0})")]
    InvalidCoarsestExtent(f32),

    /// Grid resolution outside 1..=MAX_CLIPMAP_RESOLUTION
    #[error("clipmap_resolution {0} out of range (must be 1-{max})", max = MAX_CLIPMAP_RESOLUTION)]
    InvalidClipmapResolution(u32),

    /// Atlas holds no slots or more than the slot id encoding allows
    #[error("probe atlas {0}x{1} must hold between 1 and {max} probes", max = MAX_PROBE_SLOTS)]
    InvalidProbeAtlas(u32, u32),

    /// Cached probes would be evicted before they can be reused
    #[error("num_frames_to_keep_cached_probes must be at least 1 (got {0})")]
    InvalidCachedFrames(u32),

    /// Fade size reciprocal is zero, negative or not finite
    #[error("inv_clipmap_fade_size must be positive and finite (got {0})")]
    InvalidFadeSize(f32),

    /// Trace detail distances are negative or inverted
    #[error(
        "trace distances invalid: supersample {supersample} must be >= 0 and <= downsample {downsample}"
    )]
    InvalidTraceDistances { supersample: f32, downsample: f32 },

    /// Priority histogram bucket count outside 1..=MAX_PRIORITY_HISTOGRAM_SIZE
    #[error("priority_histogram_size {0} out of range (must be 1-{max})", max = MAX_PRIORITY_HISTOGRAM_SIZE)]
    InvalidHistogramSize(u32),

    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConfigError::InvalidClipmapCount(9).to_string(),
            "num_clipmaps 9 out of range (must be 1-6)"
        );
        assert_eq!(
            ConfigError::InvalidClipmapResolution(0).to_string(),
            "clipmap_resolution 0 out of range (must be 1-256)"
        );
        assert_eq!(
            ConfigError::InvalidCachedFrames(0).to_string(),
            "num_frames_to_keep_cached_probes must be at least 1 (got 0)"
        );
    }
}

//! Clipmap state manager
//!
//! Derives, once per frame, the nested viewer-centered grids that probes
//! live on. Every level has the same resolution and an extent that grows
//! geometrically with the level index. Each level snaps its center to its
//! own cell lattice so probes don't jitter as the viewer moves.

use bytemuck::{Pod, Zeroable};
use glam::{UVec3, Vec3};

use crate::config::RadianceCacheConfig;

/// One viewer-centered grid of probe cells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipmapLevel {
    /// Viewer position snapped to a multiple of `cell_size` per axis
    pub center: Vec3,
    /// Half-width of the covered cube
    pub extent: f32,
    /// World size of one cell (`2 * extent / resolution`)
    pub cell_size: f32,
    /// Cells per axis
    pub resolution: u32,
    /// `coord = world * world_to_coord_scale + world_to_coord_bias`
    pub world_to_coord_scale: f32,
    pub world_to_coord_bias: Vec3,
    /// `cell_center = coord * coord_to_world_scale + coord_to_world_bias`
    pub coord_to_world_scale: f32,
    pub coord_to_world_bias: Vec3,
    /// Minimum ray distance when tracing probes on this level
    pub min_trace_distance: f32,
}

impl ClipmapLevel {
    /// Build level `index` around `viewer`
    pub fn new(index: u32, viewer: Vec3, config: &RadianceCacheConfig) -> Self {
        let resolution = config.clipmap_resolution;
        let extent =
            config.clipmap_world_extent * config.clipmap_distribution_base.powi(index as i32);
        let cell_size = (2.0 * extent) / resolution as f32;

        let center = (viewer / cell_size).floor() * cell_size;

        // Shift the grid down half a cell so probe centers line up across levels
        let clipmap_min = center - extent - 0.5 * cell_size;

        let min_trace_distance = if config.calculate_irradiance {
            0.0
        } else {
            Vec3::splat(cell_size).length()
        };

        Self {
            center,
            extent,
            cell_size,
            resolution,
            world_to_coord_scale: 1.0 / cell_size,
            world_to_coord_bias: -clipmap_min / cell_size,
            coord_to_world_scale: cell_size,
            coord_to_world_bias: clipmap_min + 0.5 * cell_size,
            min_trace_distance,
        }
    }

    /// Fractional grid coordinate of a world position
    #[inline]
    pub fn world_to_coord(&self, position: Vec3) -> Vec3 {
        position * self.world_to_coord_scale + self.world_to_coord_bias
    }

    /// World position of a cell's center
    #[inline]
    pub fn cell_center(&self, coord: UVec3) -> Vec3 {
        coord.as_vec3() * self.coord_to_world_scale + self.coord_to_world_bias
    }

    /// Integer cell covering `position`, or `None` outside this level
    pub fn cell_at(&self, position: Vec3) -> Option<UVec3> {
        let coord = self.world_to_coord(position).floor();
        let resolution = self.resolution as f32;
        let inside = coord.cmpge(Vec3::ZERO).all() && coord.cmplt(Vec3::splat(resolution)).all();
        inside.then(|| coord.as_uvec3())
    }

    /// Blend weight toward the next coarser level near this level's border
    ///
    /// 1.0 well inside the grid, ramping to 0.0 over `1 / inv_fade_size`
    /// cells at each face.
    pub fn edge_fade(&self, position: Vec3, inv_fade_size: f32) -> f32 {
        let coord = self.world_to_coord(position);
        let upper = Vec3::splat(self.resolution as f32 - 0.5);

        let bottom = ((coord - 0.5) * inv_fade_size).clamp(Vec3::ZERO, Vec3::ONE);
        let top = ((upper - coord) * inv_fade_size).clamp(Vec3::ZERO, Vec3::ONE);

        bottom.min_element().min(top.min_element())
    }

    /// Transforms packed the way shaders consume them
    pub fn gpu_params(&self) -> ClipmapGpuParams {
        ClipmapGpuParams {
            world_to_probe: self
                .world_to_coord_bias
                .extend(self.world_to_coord_scale)
                .to_array(),
            probe_to_world: self
                .coord_to_world_bias
                .extend(self.coord_to_world_scale)
                .to_array(),
        }
    }
}

/// Per-level transforms as two `vec4`s (bias in xyz, scale in w)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ClipmapGpuParams {
    pub world_to_probe: [f32; 4],
    pub probe_to_world: [f32; 4],
}

/// All clipmap levels plus the settings they were derived from
#[derive(Debug, Clone, Default)]
pub struct ClipmapState {
    levels: Vec<ClipmapLevel>,
    world_extent: f32,
    distribution_base: f32,
}

impl ClipmapState {
    /// Recompute every level around `viewer`
    ///
    /// Returns `true` when the extent or distribution base differs from the
    /// previous call (always `true` on the first call), signalling that
    /// cached content may no longer line up with the grids.
    pub fn update(&mut self, viewer: Vec3, config: &RadianceCacheConfig) -> bool {
        let reset = self.world_extent != config.clipmap_world_extent
            || self.distribution_base != config.clipmap_distribution_base;

        self.world_extent = config.clipmap_world_extent;
        self.distribution_base = config.clipmap_distribution_base;

        self.levels.clear();
        self.levels.extend(
            (0..config.num_clipmaps).map(|index| ClipmapLevel::new(index, viewer, config)),
        );

        reset
    }

    /// Levels ordered finest to coarsest
    pub fn levels(&self) -> &[ClipmapLevel] {
        &self.levels
    }

    /// Level by index
    pub fn level(&self, index: usize) -> Option<&ClipmapLevel> {
        self.levels.get(index)
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether `update` has not run yet
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Transforms of every level, ready for `bytemuck::cast_slice`
    pub fn gpu_params(&self) -> Vec<ClipmapGpuParams> {
        self.levels.iter().map(ClipmapLevel::gpu_params).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RadianceCacheConfig {
        RadianceCacheConfig {
            clipmap_resolution: 16,
            num_clipmaps: 3,
            ..Default::default()
        }
    }

    fn on_lattice(value: f32, cell_size: f32) -> bool {
        let cells = value / cell_size;
        (cells - cells.round()).abs() < 1e-4
    }

    // =============================================================
    // Level derivation tests
    // =============================================================

    #[test]
    fn test_cell_size_grows_geometrically() {
        let config = test_config();
        let mut state = ClipmapState::default();
        state.update(Vec3::new(3.7, -12.2, 41.9), &config);

        assert_eq!(state.len(), 3);
        for (index, level) in state.levels().iter().enumerate() {
            let expected = 2.0 * 20.0 * 2.0f32.powi(index as i32) / 16.0;
            assert!((level.cell_size - expected).abs() < 1e-5);
            assert!((level.extent - 20.0 * 2.0f32.powi(index as i32)).abs() < 1e-5);
            assert_eq!(state.level(index), Some(level));
        }
        assert!(state.level(3).is_none());
    }

    #[test]
    fn test_center_on_own_lattice() {
        let config = test_config();
        let mut state = ClipmapState::default();
        for viewer in [
            Vec3::new(3.7, -12.2, 41.9),
            Vec3::new(-0.01, 0.0, 1000.3),
            Vec3::new(-77.5, 2.5, -2.4999),
        ] {
            state.update(viewer, &config);
            for level in state.levels() {
                assert!(on_lattice(level.center.x, level.cell_size));
                assert!(on_lattice(level.center.y, level.cell_size));
                assert!(on_lattice(level.center.z, level.cell_size));
                // Snapping never moves the center more than one cell
                assert!((viewer - level.center).abs().max_element() < level.cell_size + 1e-4);
            }
        }
    }

    #[test]
    fn test_min_trace_distance() {
        let config = test_config();
        let level = ClipmapLevel::new(0, Vec3::ZERO, &config);
        assert!((level.min_trace_distance - 2.5 * 3.0f32.sqrt()).abs() < 1e-5);

        let irradiance = RadianceCacheConfig {
            calculate_irradiance: true,
            ..test_config()
        };
        let level = ClipmapLevel::new(0, Vec3::ZERO, &irradiance);
        assert_eq!(level.min_trace_distance, 0.0);
    }

    // =============================================================
    // Transform tests
    // =============================================================

    #[test]
    fn test_cell_center_round_trip() {
        let config = test_config();
        let level = ClipmapLevel::new(1, Vec3::new(10.0, 5.0, -3.0), &config);

        for coord in [UVec3::ZERO, UVec3::new(7, 8, 9), UVec3::splat(15)] {
            let center = level.cell_center(coord);
            assert_eq!(level.cell_at(center), Some(coord));
        }
    }

    #[test]
    fn test_middle_cell_is_centered_on_viewer_snap() {
        let config = test_config();
        let level = ClipmapLevel::new(0, Vec3::new(1.0, 1.0, 1.0), &config);
        let middle = UVec3::splat(config.clipmap_resolution / 2);
        assert!((level.cell_center(middle) - level.center).length() < 1e-4);
    }

    #[test]
    fn test_cell_at_outside_is_none() {
        let config = test_config();
        let level = ClipmapLevel::new(0, Vec3::ZERO, &config);
        assert!(level.cell_at(Vec3::new(1000.0, 0.0, 0.0)).is_none());
        assert!(level.cell_at(Vec3::new(0.0, -1000.0, 0.0)).is_none());
        assert!(level.cell_at(Vec3::ZERO).is_some());
    }

    #[test]
    fn test_adjacent_levels_share_probe_centers() {
        let config = test_config();
        let viewer = Vec3::new(4.0, -6.0, 2.0);
        let fine = ClipmapLevel::new(0, viewer, &config);
        let coarse = ClipmapLevel::new(1, viewer, &config);

        // Every coarse probe center is also a fine probe center
        for coord in [UVec3::splat(4), UVec3::new(6, 9, 7)] {
            let fine_coord = fine.world_to_coord(coarse.cell_center(coord)) - 0.5;
            assert!((fine_coord - fine_coord.round()).abs().max_element() < 1e-3);
        }
    }

    #[test]
    fn test_edge_fade() {
        let config = test_config();
        let level = ClipmapLevel::new(0, Vec3::ZERO, &config);

        assert_eq!(level.edge_fade(level.center, 1.0), 1.0);
        let corner = level.cell_center(UVec3::ZERO);
        assert_eq!(level.edge_fade(corner, 1.0), 0.0);
        let far = level.center + Vec3::splat(1000.0);
        assert_eq!(level.edge_fade(far, 1.0), 0.0);

        // Half a cell in from the first probe center with a one-cell fade
        let inside = corner + Vec3::splat(0.5 * level.cell_size);
        assert!((level.edge_fade(inside, 1.0) - 0.5).abs() < 1e-4);
    }

    // =============================================================
    // Reset signal tests
    // =============================================================

    #[test]
    fn test_reset_signal() {
        let mut config = test_config();
        let mut state = ClipmapState::default();

        assert!(state.update(Vec3::ZERO, &config));
        assert!(!state.update(Vec3::new(50.0, 0.0, 0.0), &config));

        config.clipmap_world_extent = 25.0;
        assert!(state.update(Vec3::ZERO, &config));
        assert!(!state.update(Vec3::ZERO, &config));

        config.clipmap_distribution_base = 3.0;
        assert!(state.update(Vec3::ZERO, &config));
    }

    #[test]
    fn test_gpu_params_layout() {
        let config = test_config();
        let mut state = ClipmapState::default();
        state.update(Vec3::new(1.0, 2.0, 3.0), &config);

        let params = state.gpu_params();
        let bytes: &[u8] = bytemuck::cast_slice(&params);
        assert_eq!(bytes.len(), 3 * 32);

        let level = state.levels()[0];
        assert_eq!(params[0].world_to_probe[3], level.world_to_coord_scale);
        assert_eq!(params[0].probe_to_world[0], level.coord_to_world_bias.x);
    }
}

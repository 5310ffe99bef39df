//! Frame lifecycle coordinator
//!
//! [`RadianceCache`] owns every per-frame resource and runs the passes in a
//! fixed order:
//!
//! clipmap update → clear → mark → reproject → release stale → allocate →
//! histogram → threshold → emit → snapshot
//!
//! Each pass finishes before the next starts. The per-frame path never
//! fails; anomalies such as free-list exhaustion show up in [`FrameStats`].

use glam::{UVec3, Vec3};
use serde::Serialize;

use crate::allocator::SlotAllocator;
use crate::clipmap::{ClipmapGpuParams, ClipmapLevel, ClipmapState};
use crate::config::{RadianceCacheConfig, ResetPolicy};
use crate::error::ConfigError;
use crate::index::{CellLayout, CellState, IndirectionSnapshot, ProbeIndirection};
use crate::scheduler::{
    DistanceStalenessPolicy, PriorityPolicy, PriorityScheduler, SchedulingView, TraceWorkItem,
};
use crate::slots::{SlotId, SlotPool};

/// Index and clipmap transforms of a completed frame
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    frame: u32,
    index: IndirectionSnapshot,
    levels: Vec<ClipmapLevel>,
}

impl FrameSnapshot {
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn index(&self) -> &IndirectionSnapshot {
        &self.index
    }

    /// Level transforms the snapshot was built with
    pub fn levels(&self) -> &[ClipmapLevel] {
        &self.levels
    }
}

/// Counters for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frame: u32,
    /// Cells newly marked as requested
    pub requested: usize,
    /// Requested cells that inherited a slot from the previous frame
    pub reprojected: usize,
    /// Unrequested cells still holding a cached slot
    pub retained: usize,
    /// Slots bound to pending cells
    pub allocated: usize,
    /// Pending cells left without a slot
    pub allocation_failures: usize,
    /// Slots returned to the free list
    pub released: usize,
    /// Resident probes competing for the trace budget
    pub candidates: usize,
    /// Probes handed to the tracer
    pub traced: usize,
    pub threshold_bucket: u32,
    pub active_slots: usize,
    pub free_slots: usize,
}

/// Result of [`RadianceCache::update`]
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub frame: u32,
    /// Extent or distribution base changed since the previous frame
    pub state_reset: bool,
    /// Probes to trace this frame, highest priority first
    pub work_list: Vec<TraceWorkItem>,
    pub stats: FrameStats,
}

/// Where a world position's radiance lives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeLookup {
    pub slot: SlotId,
    pub level: u32,
    pub coord: UVec3,
    /// Blend weight toward the next coarser level
    pub edge_fade: f32,
}

/// Radiance probe cache driven once per frame
pub struct RadianceCache {
    config: RadianceCacheConfig,
    clipmaps: ClipmapState,
    index: ProbeIndirection,
    allocator: SlotAllocator,
    scheduler: PriorityScheduler,
    previous: Option<FrameSnapshot>,
    frame: u32,
    viewer: Vec3,
    /// Whether the last allocation pass ran out of slots
    exhausted: bool,
}

impl std::fmt::Debug for RadianceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadianceCache")
            .field("frame", &self.frame)
            .field("levels", &self.clipmaps.len())
            .field("index", &self.index)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

fn cell_layout(config: &RadianceCacheConfig) -> CellLayout {
    CellLayout::new(config.clipmap_resolution, config.num_clipmaps)
}

impl RadianceCache {
    /// Create a cache using the default priority policy
    ///
    /// # Errors
    ///
    /// Returns the first invalid field of `config`.
    pub fn new(config: RadianceCacheConfig) -> Result<Self, ConfigError> {
        Self::with_policy(config, Box::new(DistanceStalenessPolicy))
    }

    /// Create a cache with a custom priority policy
    pub fn with_policy(
        config: RadianceCacheConfig,
        policy: Box<dyn PriorityPolicy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let layout = cell_layout(&config);
        tracing::info!(
            levels = config.num_clipmaps,
            resolution = config.clipmap_resolution,
            cells = layout.cell_count(),
            slots = config.max_probe_count(),
            "Created radiance cache"
        );

        Ok(Self {
            index: ProbeIndirection::new(layout),
            allocator: SlotAllocator::new(config.max_probe_count()),
            scheduler: PriorityScheduler::new(config.priority_histogram_size, policy),
            clipmaps: ClipmapState::default(),
            previous: None,
            frame: 0,
            viewer: Vec3::ZERO,
            exhausted: false,
            config,
        })
    }

    /// Run one frame around `viewer` for this frame's probe requests
    pub fn update(&mut self, viewer: Vec3, candidates: &[Vec3]) -> FrameOutput {
        self.frame = self.frame.wrapping_add(1).max(1);
        self.viewer = viewer;
        let frame = self.frame;
        let max_age = self.config.num_frames_to_keep_cached_probes;

        let state_reset = self.clipmaps.update(viewer, &self.config);
        if state_reset && self.previous.is_some() {
            match self.config.reset_policy {
                ResetPolicy::Retain => {
                    tracing::info!(frame, "Clipmap extent changed, keeping cached probes");
                }
                ResetPolicy::Invalidate => {
                    tracing::info!(frame, "Clipmap extent changed, dropping cached probes");
                    self.previous = None;
                }
            }
        }

        self.index.clear();
        let requested = self.index.mark_all(candidates, self.clipmaps.levels());

        let (reprojection, released) = match &self.previous {
            Some(previous) => {
                let report = self.index.reproject(
                    &previous.index,
                    &previous.levels,
                    self.clipmaps.levels(),
                    self.allocator.pool(),
                    frame,
                    max_age,
                );
                let released = self.allocator.release_stale(&self.index, frame, max_age);
                (report, released)
            }
            None => {
                self.allocator.seed();
                (Default::default(), 0)
            }
        };

        let allocation = self.allocator.allocate_pending(
            &self.index,
            frame,
            self.clipmaps.levels(),
            viewer,
        );
        if allocation.failed > 0 && !self.exhausted {
            tracing::warn!(
                frame,
                unallocated = allocation.failed,
                capacity = self.allocator.pool().capacity(),
                "Probe slots exhausted, requests stay pending"
            );
        }
        self.exhausted = allocation.failed > 0;

        let view = SchedulingView {
            index: &self.index,
            levels: self.clipmaps.levels(),
            slots: self.allocator.pool(),
            viewer,
            frame,
            first_clipmap_extent_rcp: self.config.first_clipmap_world_extent_rcp(),
            supersample_distance: self.config.supersample_distance_from_camera,
            downsample_distance: self.config.downsample_distance_from_camera,
        };
        let scored = self.scheduler.build_histogram(&view);
        let threshold = self
            .scheduler
            .select_threshold(self.config.num_probes_to_trace_budget);
        let work_list = self.scheduler.emit_work_list(&view, threshold);

        self.previous = Some(FrameSnapshot {
            frame,
            index: self.index.snapshot(),
            levels: self.clipmaps.levels().to_vec(),
        });

        let stats = FrameStats {
            frame,
            requested,
            reprojected: reprojection.reused,
            retained: reprojection.retained,
            allocated: allocation.allocated,
            allocation_failures: allocation.failed,
            released,
            candidates: scored,
            traced: work_list.len(),
            threshold_bucket: threshold.bucket,
            active_slots: self.allocator.pool().active_count(),
            free_slots: self.allocator.free_count(),
        };
        tracing::debug!(
            frame,
            requested,
            allocated = stats.allocated,
            released,
            traced = stats.traced,
            threshold = threshold.bucket,
            "Radiance cache frame"
        );

        FrameOutput {
            frame,
            state_reset,
            work_list,
            stats,
        }
    }

    /// Apply a new configuration
    ///
    /// Changes to level count, resolution, atlas size or histogram size
    /// rebuild every resource and restart at a first frame. Anything else
    /// takes effect on the next [`update`](Self::update); extent and
    /// distribution base changes surface there as `state_reset`.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field; the current configuration is kept.
    pub fn reconfigure(&mut self, config: RadianceCacheConfig) -> Result<(), ConfigError> {
        config.validate()?;

        if self.config.layout_differs(&config) {
            let layout = cell_layout(&config);
            self.index = ProbeIndirection::new(layout);
            self.allocator = SlotAllocator::new(config.max_probe_count());
            self.scheduler
                .resize_histogram(config.priority_histogram_size);
            self.previous = None;
            self.exhausted = false;
            tracing::info!(
                levels = config.num_clipmaps,
                resolution = config.clipmap_resolution,
                slots = config.max_probe_count(),
                "Rebuilt radiance cache for new layout"
            );
        }

        self.config = config;
        Ok(())
    }

    /// Swap the priority policy, effective next frame
    pub fn set_policy(&mut self, policy: Box<dyn PriorityPolicy>) {
        self.scheduler.set_policy(policy);
    }

    /// Set a slot's sub-cell jitter
    ///
    /// Returns `false` if `slot` is outside the pool.
    pub fn set_probe_world_offset(&mut self, slot: SlotId, offset: Vec3) -> bool {
        if slot.raw() >= self.allocator.pool().capacity() {
            return false;
        }
        self.allocator.pool_mut().set_world_offset(slot, offset);
        true
    }

    /// Find the probe covering `position`, finest level first
    pub fn lookup(&self, position: Vec3) -> Option<ProbeLookup> {
        let layout = self.index.layout();
        self.clipmaps
            .levels()
            .iter()
            .enumerate()
            .find_map(|(level, clipmap)| {
                let coord = clipmap.cell_at(position)?;
                let slot = self.index.get(layout.linear(level as u32, coord)).slot()?;
                Some(ProbeLookup {
                    slot,
                    level: level as u32,
                    coord,
                    edge_fade: clipmap.edge_fade(position, self.config.inv_clipmap_fade_size),
                })
            })
    }

    /// World positions of every probe held by the index, in cell order
    pub fn active_probe_positions(&self) -> Vec<Vec3> {
        let layout = self.index.layout();
        let levels = self.clipmaps.levels();
        let slots = self.allocator.pool();
        self.index
            .cells_where(|state| state.slot().is_some())
            .into_iter()
            .filter_map(|cell| {
                let slot = self.index.get(cell).slot()?;
                let (level, coord) = layout.coord_of(cell);
                let clipmap = levels.get(level as usize)?;
                Some(clipmap.cell_center(coord) + slots.world_offset(slot))
            })
            .collect()
    }

    /// Cells still waiting for a slot after the last frame
    pub fn pending_cells(&self) -> Vec<usize> {
        self.index.cells_where(|state| state == CellState::Pending)
    }

    pub fn config(&self) -> &RadianceCacheConfig {
        &self.config
    }

    /// Last completed frame number (0 before the first update)
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn viewer(&self) -> Vec3 {
        self.viewer
    }

    pub fn clipmaps(&self) -> &ClipmapState {
        &self.clipmaps
    }

    pub fn index(&self) -> &ProbeIndirection {
        &self.index
    }

    pub fn slots(&self) -> &SlotPool {
        self.allocator.pool()
    }

    pub fn free_slot_count(&self) -> usize {
        self.allocator.free_count()
    }

    /// Snapshot kept for reprojection next frame
    pub fn previous_frame(&self) -> Option<&FrameSnapshot> {
        self.previous.as_ref()
    }

    /// Per-level transforms for upload
    pub fn gpu_params(&self) -> Vec<ClipmapGpuParams> {
        self.clipmaps.gpu_params()
    }

    /// Per-level transforms as bytes
    pub fn gpu_params_bytes(&self) -> Vec<u8> {
        let params = self.gpu_params();
        bytemuck::cast_slice::<ClipmapGpuParams, u8>(&params).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RadianceCacheConfig {
        RadianceCacheConfig {
            num_clipmaps: 2,
            clipmap_resolution: 8,
            probe_atlas_resolution: [8, 8],
            num_probes_to_trace_budget: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RadianceCacheConfig {
            num_clipmaps: 0,
            ..Default::default()
        };
        assert!(matches!(
            RadianceCache::new(config),
            Err(ConfigError::InvalidClipmapCount(0))
        ));
    }

    #[test]
    fn test_first_frame() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        assert_eq!(cache.frame(), 0);
        assert!(cache.previous_frame().is_none());

        let output = cache.update(Vec3::ZERO, &[Vec3::new(1.0, 1.0, 1.0)]);
        assert_eq!(output.frame, 1);
        assert!(output.state_reset);
        // One cell on each of the two levels
        assert_eq!(output.stats.requested, 2);
        assert_eq!(output.stats.allocated, 2);
        assert_eq!(output.stats.reprojected, 0);
        assert_eq!(output.work_list.len(), 2);
        assert_eq!(output.stats.free_slots, 62);
        assert_eq!(cache.previous_frame().map(FrameSnapshot::frame), Some(1));
    }

    #[test]
    fn test_steady_state_reuses_slots() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        let candidates = [Vec3::new(1.0, 1.0, 1.0), Vec3::new(-3.0, 2.0, 0.5)];
        let first = cache.update(Vec3::ZERO, &candidates);

        let second = cache.update(Vec3::ZERO, &candidates);
        assert!(!second.state_reset);
        assert_eq!(second.stats.allocated, 0);
        assert_eq!(second.stats.reprojected, first.stats.allocated);
        assert_eq!(second.stats.active_slots, first.stats.active_slots);
    }

    #[test]
    fn test_set_policy_takes_effect_next_frame() {
        struct Fixed;
        impl PriorityPolicy for Fixed {
            fn score_priority(&self, _: &crate::scheduler::PriorityInput, _: u32) -> u32 {
                9
            }
        }

        let mut cache = RadianceCache::new(small_config()).unwrap();
        let candidates: Vec<Vec3> = (0..24)
            .map(|i| Vec3::new((i % 6) as f32 * 5.0 - 12.0, (i / 6) as f32 * 5.0 - 8.0, 1.0))
            .collect();
        let first = cache.update(Vec3::ZERO, &candidates);
        assert_eq!(first.work_list.len(), 16);
        assert!(first.work_list.iter().any(|item| item.priority != 9));

        cache.set_policy(Box::new(Fixed));
        let second = cache.update(Vec3::ZERO, &candidates);
        assert!(!second.work_list.is_empty());
        assert!(second.work_list.iter().all(|item| item.priority == 9));
    }

    #[test]
    fn test_lookup_prefers_finest_level() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        let position = Vec3::new(0.3, 0.2, 0.1);
        cache.update(Vec3::ZERO, &[position]);

        let lookup = cache.lookup(position).unwrap();
        assert_eq!(lookup.level, 0);
        assert_eq!(lookup.edge_fade, 1.0);
        assert!(cache.lookup(Vec3::splat(500.0)).is_none());
    }

    #[test]
    fn test_active_probe_positions_apply_offset() {
        let mut cache = RadianceCache::new(RadianceCacheConfig {
            num_clipmaps: 1,
            ..small_config()
        })
        .unwrap();
        let output = cache.update(Vec3::ZERO, &[Vec3::new(0.3, 0.2, 0.1)]);
        let slot = output.work_list[0].slot;
        let center = output.work_list[0].position;

        assert!(cache.set_probe_world_offset(slot, Vec3::new(0.5, 0.0, 0.0)));
        assert!(!cache.set_probe_world_offset(SlotId::new(1000), Vec3::ZERO));
        assert_eq!(
            cache.active_probe_positions(),
            vec![center + Vec3::new(0.5, 0.0, 0.0)]
        );
    }

    #[test]
    fn test_reconfigure_layout_rebuilds() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        cache.update(Vec3::ZERO, &[Vec3::ONE]);

        cache
            .reconfigure(RadianceCacheConfig {
                probe_atlas_resolution: [4, 4],
                ..small_config()
            })
            .unwrap();
        assert!(cache.previous_frame().is_none());
        assert_eq!(cache.slots().capacity(), 16);
        assert_eq!(cache.free_slot_count(), 16);
    }

    #[test]
    fn test_reconfigure_invalid_keeps_config() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        let bad = RadianceCacheConfig {
            clipmap_world_extent: -1.0,
            ..small_config()
        };
        assert!(cache.reconfigure(bad).is_err());
        assert_eq!(cache.config().clipmap_world_extent, 20.0);
    }

    #[test]
    fn test_gpu_params_bytes() {
        let mut cache = RadianceCache::new(small_config()).unwrap();
        cache.update(Vec3::ZERO, &[]);
        assert_eq!(cache.gpu_params_bytes().len(), 2 * 32);
    }
}

//! Probe indirection index
//!
//! Sparse mapping from (clipmap level, grid cell) to probe slot, rebuilt every
//! frame. Conceptually a 3D volume whose X axis is split across levels:
//! `(resolution * levels) x resolution x resolution` cells.
//!
//! Each cell is one `AtomicU32` so every pass can run one worker per cell.
//! Passes are separated by rayon barriers, so relaxed ordering is enough for
//! values written in an earlier pass.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{UVec3, Vec3};
use rayon::prelude::*;

use crate::clipmap::ClipmapLevel;
use crate::slots::{SlotId, SlotPool};

/// Raw value of a cell with no probe and no request
pub const CELL_EMPTY: u32 = u32::MAX;

/// Raw value of a requested cell still waiting for a slot
pub const CELL_PENDING: u32 = u32::MAX - 1;

/// Set on slot values whose cell was requested this frame
const RESIDENT_BIT: u32 = 1 << 31;

/// Decoded state of one indirection cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// No probe, not requested
    Empty,
    /// Requested this frame, no slot bound yet
    Pending,
    /// Slot kept from an earlier frame, not requested this frame
    Cached(SlotId),
    /// Slot bound and requested this frame
    Resident(SlotId),
}

impl CellState {
    /// Pack into the raw cell value
    #[inline]
    pub fn encode(self) -> u32 {
        match self {
            CellState::Empty => CELL_EMPTY,
            CellState::Pending => CELL_PENDING,
            CellState::Cached(slot) => slot.raw(),
            CellState::Resident(slot) => slot.raw() | RESIDENT_BIT,
        }
    }

    /// Unpack a raw cell value
    #[inline]
    pub fn decode(raw: u32) -> Self {
        match raw {
            CELL_EMPTY => CellState::Empty,
            CELL_PENDING => CellState::Pending,
            _ if raw & RESIDENT_BIT != 0 => CellState::Resident(SlotId::new(raw & !RESIDENT_BIT)),
            _ => CellState::Cached(SlotId::new(raw)),
        }
    }

    /// Slot held by this cell, if any
    #[inline]
    pub fn slot(self) -> Option<SlotId> {
        match self {
            CellState::Cached(slot) | CellState::Resident(slot) => Some(slot),
            CellState::Empty | CellState::Pending => None,
        }
    }

    /// Whether the cell was requested this frame
    #[inline]
    pub fn is_requested(self) -> bool {
        matches!(self, CellState::Pending | CellState::Resident(_))
    }
}

/// Shape of the indirection volume and the cell <-> linear index mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLayout {
    pub resolution: u32,
    pub num_levels: u32,
}

impl CellLayout {
    pub fn new(resolution: u32, num_levels: u32) -> Self {
        Self {
            resolution,
            num_levels,
        }
    }

    /// Volume size in cells, levels laid side by side along X
    pub fn volume_extent(&self) -> UVec3 {
        UVec3::new(
            self.resolution * self.num_levels,
            self.resolution,
            self.resolution,
        )
    }

    /// Total number of cells across all levels
    pub fn cell_count(&self) -> usize {
        let res = self.resolution as usize;
        res * res * res * self.num_levels as usize
    }

    /// Linear index of `coord` on `level`
    #[inline]
    pub fn linear(&self, level: u32, coord: UVec3) -> usize {
        let res = self.resolution as usize;
        let width = res * self.num_levels as usize;
        let x = level as usize * res + coord.x as usize;
        x + width * (coord.y as usize + res * coord.z as usize)
    }

    /// Inverse of [`linear`](Self::linear)
    #[inline]
    pub fn coord_of(&self, index: usize) -> (u32, UVec3) {
        let res = self.resolution as usize;
        let width = res * self.num_levels as usize;
        let x = index % width;
        let yz = index / width;
        let coord = UVec3::new((x % res) as u32, (yz % res) as u32, (yz / res) as u32);
        ((x / res) as u32, coord)
    }
}

/// Immutable copy of a frame's index, kept for reprojection next frame
#[derive(Debug, Clone)]
pub struct IndirectionSnapshot {
    layout: CellLayout,
    cells: Vec<u32>,
}

impl IndirectionSnapshot {
    pub fn layout(&self) -> CellLayout {
        self.layout
    }

    /// State of `coord` on `level` when the snapshot was taken
    pub fn get(&self, level: u32, coord: UVec3) -> CellState {
        CellState::decode(self.cells[self.layout.linear(level, coord)])
    }

    /// Number of cells holding a slot
    pub fn occupied(&self) -> usize {
        self.cells
            .iter()
            .filter(|&&raw| CellState::decode(raw).slot().is_some())
            .count()
    }
}

/// Counters from one reprojection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprojectionReport {
    /// Requested cells that inherited a slot
    pub reused: usize,
    /// Unrequested cells that kept a cached slot
    pub retained: usize,
}

/// Per-frame cell -> slot mapping
pub struct ProbeIndirection {
    layout: CellLayout,
    cells: Vec<AtomicU32>,
}

impl std::fmt::Debug for ProbeIndirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeIndirection")
            .field("layout", &self.layout)
            .field("cells", &self.cells.len())
            .finish()
    }
}

impl ProbeIndirection {
    /// Allocate an all-empty index
    pub fn new(layout: CellLayout) -> Self {
        let cells = (0..layout.cell_count())
            .map(|_| AtomicU32::new(CELL_EMPTY))
            .collect();
        Self { layout, cells }
    }

    pub fn layout(&self) -> CellLayout {
        self.layout
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Current state of a cell
    #[inline]
    pub fn get(&self, cell: usize) -> CellState {
        CellState::decode(self.cells[cell].load(Ordering::Relaxed))
    }

    /// Overwrite a cell (caller must be the cell's only writer this pass)
    #[inline]
    pub fn set(&self, cell: usize, state: CellState) {
        self.cells[cell].store(state.encode(), Ordering::Relaxed);
    }

    /// Replace `expected` with `new`, failing if another worker got there first
    #[inline]
    pub fn compare_and_set(&self, cell: usize, expected: CellState, new: CellState) -> bool {
        self.cells[cell]
            .compare_exchange(
                expected.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Reset every cell to empty
    pub fn clear(&self) {
        self.cells
            .par_iter()
            .for_each(|cell| cell.store(CELL_EMPTY, Ordering::Relaxed));
    }

    /// Mark the cell covering `position` on every level that contains it
    ///
    /// Idempotent. Returns how many cells went from empty to pending.
    pub fn mark_requested(&self, position: Vec3, levels: &[ClipmapLevel]) -> usize {
        levels
            .iter()
            .enumerate()
            .filter_map(|(level, clipmap)| {
                clipmap
                    .cell_at(position)
                    .map(|coord| self.layout.linear(level as u32, coord))
            })
            .filter(|&cell| {
                self.cells[cell]
                    .compare_exchange(
                        CELL_EMPTY,
                        CELL_PENDING,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            })
            .count()
    }

    /// Mark every candidate position in parallel
    pub fn mark_all(&self, positions: &[Vec3], levels: &[ClipmapLevel]) -> usize {
        positions
            .par_iter()
            .map(|&position| self.mark_requested(position, levels))
            .sum()
    }

    /// Carry slots over from the previous frame's index
    ///
    /// Each current cell looks up the previous cell covering its center,
    /// using the previous frame's transforms since levels may have
    /// re-snapped. A found slot moves here unless it exceeded `max_age` or
    /// another cell already claimed it. Requested cells claim first and
    /// refresh the slot's last-used frame, so when several cells map onto
    /// one old cell a request wins over an empty neighbor. Unrequested cells
    /// then keep whatever is left as cached.
    pub fn reproject(
        &self,
        previous: &IndirectionSnapshot,
        previous_levels: &[ClipmapLevel],
        levels: &[ClipmapLevel],
        slots: &SlotPool,
        frame: u32,
        max_age: u32,
    ) -> ReprojectionReport {
        let inherit = |cell: usize| -> Option<SlotId> {
            let slot = self.previous_slot(cell, previous, previous_levels, levels)?;
            if frame.wrapping_sub(slots.last_used_frame(slot)) > max_age {
                return None;
            }
            slots.claim(slot, cell, frame).then_some(slot)
        };

        let reused = (0..self.cells.len())
            .into_par_iter()
            .filter(|&cell| self.get(cell).is_requested())
            .filter(|&cell| match inherit(cell) {
                Some(slot) => {
                    slots.touch(slot, frame);
                    self.set(cell, CellState::Resident(slot));
                    true
                }
                None => false,
            })
            .count();

        let retained = (0..self.cells.len())
            .into_par_iter()
            .filter(|&cell| self.get(cell) == CellState::Empty)
            .filter(|&cell| match inherit(cell) {
                Some(slot) => {
                    self.set(cell, CellState::Cached(slot));
                    true
                }
                None => false,
            })
            .count();

        ReprojectionReport { reused, retained }
    }

    fn previous_slot(
        &self,
        cell: usize,
        previous: &IndirectionSnapshot,
        previous_levels: &[ClipmapLevel],
        levels: &[ClipmapLevel],
    ) -> Option<SlotId> {
        let (level, coord) = self.layout.coord_of(cell);
        let current = levels.get(level as usize)?;
        let prior = previous_levels.get(level as usize)?;
        if level >= previous.layout.num_levels {
            return None;
        }

        let world = current.cell_center(coord);
        let prev_coord = prior.cell_at(world)?;
        previous.get(level, prev_coord).slot()
    }

    /// Copy the current cells into an immutable snapshot
    pub fn snapshot(&self) -> IndirectionSnapshot {
        IndirectionSnapshot {
            layout: self.layout,
            cells: self
                .cells
                .par_iter()
                .map(|cell| cell.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Indices of cells whose state matches `predicate`, in cell order
    pub fn cells_where(&self, predicate: impl Fn(CellState) -> bool + Sync) -> Vec<usize> {
        (0..self.cells.len())
            .into_par_iter()
            .filter(|&cell| predicate(self.get(cell)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipmap::ClipmapState;
    use crate::config::RadianceCacheConfig;

    fn test_config() -> RadianceCacheConfig {
        RadianceCacheConfig {
            clipmap_resolution: 8,
            num_clipmaps: 2,
            probe_atlas_resolution: [4, 4],
            ..Default::default()
        }
    }

    fn levels_at(viewer: Vec3, config: &RadianceCacheConfig) -> Vec<ClipmapLevel> {
        let mut state = ClipmapState::default();
        state.update(viewer, config);
        state.levels().to_vec()
    }

    // =============================================================
    // Encoding and layout tests
    // =============================================================

    #[test]
    fn test_cell_state_encoding() {
        for state in [
            CellState::Empty,
            CellState::Pending,
            CellState::Cached(SlotId::new(0)),
            CellState::Cached(SlotId::new(12345)),
            CellState::Resident(SlotId::new(0)),
            CellState::Resident(SlotId::new((1 << 24) - 1)),
        ] {
            assert_eq!(CellState::decode(state.encode()), state);
        }
        assert!(CellState::Pending.is_requested());
        assert!(!CellState::Cached(SlotId::new(3)).is_requested());
        assert_eq!(CellState::Resident(SlotId::new(3)).slot(), Some(SlotId::new(3)));
    }

    #[test]
    fn test_layout_linear_inverse() {
        let layout = CellLayout::new(4, 3);
        assert_eq!(layout.volume_extent(), UVec3::new(12, 4, 4));
        assert_eq!(layout.cell_count(), 192);

        let mut seen = vec![false; layout.cell_count()];
        for level in 0..3 {
            for z in 0..4 {
                for y in 0..4 {
                    for x in 0..4 {
                        let coord = UVec3::new(x, y, z);
                        let index = layout.linear(level, coord);
                        assert!(!seen[index]);
                        seen[index] = true;
                        assert_eq!(layout.coord_of(index), (level, coord));
                    }
                }
            }
        }
    }

    // =============================================================
    // Clear and mark tests
    // =============================================================

    #[test]
    fn test_mark_requested_every_level() {
        let config = test_config();
        let levels = levels_at(Vec3::ZERO, &config);
        let index = ProbeIndirection::new(CellLayout::new(8, 2));

        let marked = index.mark_requested(Vec3::new(1.0, 2.0, 3.0), &levels);
        assert_eq!(marked, 2);

        let pending = index.cells_where(|state| state == CellState::Pending);
        assert_eq!(pending.len(), 2);
        let levels_hit: Vec<u32> = pending.iter().map(|&c| index.layout().coord_of(c).0).collect();
        assert!(levels_hit.contains(&0) && levels_hit.contains(&1));
    }

    #[test]
    fn test_mark_requested_idempotent() {
        let config = test_config();
        let levels = levels_at(Vec3::ZERO, &config);
        let index = ProbeIndirection::new(CellLayout::new(8, 2));
        let position = Vec3::new(-4.0, 0.5, 7.0);

        index.mark_requested(position, &levels);
        let once = index.snapshot();
        assert_eq!(index.mark_requested(position, &levels), 0);
        let twice = index.snapshot();
        assert_eq!(once.cells, twice.cells);
    }

    #[test]
    fn test_mark_outside_all_levels() {
        let config = test_config();
        let levels = levels_at(Vec3::ZERO, &config);
        let index = ProbeIndirection::new(CellLayout::new(8, 2));
        assert_eq!(index.mark_requested(Vec3::splat(1.0e4), &levels), 0);
    }

    #[test]
    fn test_clear_resets_everything() {
        let config = test_config();
        let levels = levels_at(Vec3::ZERO, &config);
        let index = ProbeIndirection::new(CellLayout::new(8, 2));
        index.mark_all(&[Vec3::ZERO, Vec3::ONE * 5.0], &levels);
        index.set(0, CellState::Cached(SlotId::new(1)));

        index.clear();
        assert!(index.cells_where(|state| state != CellState::Empty).is_empty());
    }

    // =============================================================
    // Reprojection tests
    // =============================================================

    fn bind(index: &ProbeIndirection, slots: &SlotPool, cell: usize, slot: u32, frame: u32) {
        let slot = SlotId::new(slot);
        assert!(slots.activate(slot, cell, frame));
        index.set(cell, CellState::Resident(slot));
    }

    #[test]
    fn test_reproject_follows_resnapped_level() {
        let config = test_config();
        let slots = SlotPool::new(16);
        let layout = CellLayout::new(8, 2);
        let position = Vec3::new(1.0, 1.0, 1.0);

        // Frame 1: probe bound at `position` on level 0
        let old_levels = levels_at(Vec3::ZERO, &config);
        let old = ProbeIndirection::new(layout);
        let old_coord = old_levels[0].cell_at(position).unwrap();
        bind(&old, &slots, layout.linear(0, old_coord), 5, 1);
        let snapshot = old.snapshot();

        // Frame 2: viewer moved three cells along X, level 0 re-snapped
        let new_levels = levels_at(Vec3::new(3.0 * old_levels[0].cell_size, 0.0, 0.0), &config);
        let new_coord = new_levels[0].cell_at(position).unwrap();
        assert_ne!(old_coord, new_coord);

        let index = ProbeIndirection::new(layout);
        index.mark_requested(position, &new_levels);
        let report = index.reproject(&snapshot, &old_levels, &new_levels, &slots, 2, 3);

        assert_eq!(report.reused, 1);
        assert_eq!(
            index.get(layout.linear(0, new_coord)),
            CellState::Resident(SlotId::new(5))
        );
        assert_eq!(slots.last_used_frame(SlotId::new(5)), 2);
    }

    #[test]
    fn test_reproject_retains_unrequested_as_cached() {
        let config = test_config();
        let slots = SlotPool::new(16);
        let layout = CellLayout::new(8, 2);
        let levels = levels_at(Vec3::ZERO, &config);

        let old = ProbeIndirection::new(layout);
        bind(&old, &slots, layout.linear(1, UVec3::new(2, 3, 4)), 7, 1);
        let snapshot = old.snapshot();

        let index = ProbeIndirection::new(layout);
        let report = index.reproject(&snapshot, &levels, &levels, &slots, 2, 3);

        assert_eq!(report, ReprojectionReport { reused: 0, retained: 1 });
        assert_eq!(
            index.get(layout.linear(1, UVec3::new(2, 3, 4))),
            CellState::Cached(SlotId::new(7))
        );
        // Aging continues for unrequested probes
        assert_eq!(slots.last_used_frame(SlotId::new(7)), 1);
    }

    #[test]
    fn test_reproject_skips_aged_out_slot() {
        let config = test_config();
        let slots = SlotPool::new(16);
        let layout = CellLayout::new(8, 2);
        let levels = levels_at(Vec3::ZERO, &config);
        let cell = layout.linear(0, UVec3::new(4, 4, 4));

        let old = ProbeIndirection::new(layout);
        bind(&old, &slots, cell, 2, 10);
        let snapshot = old.snapshot();

        let index = ProbeIndirection::new(layout);
        index.set(cell, CellState::Pending);
        let report = index.reproject(&snapshot, &levels, &levels, &slots, 14, 3);

        assert_eq!(report.reused, 0);
        assert_eq!(index.get(cell), CellState::Pending);
    }

    #[test]
    fn test_reproject_never_aliases_a_slot() {
        // Halving the extent maps several new cells onto one old cell
        let config = test_config();
        let coarse = RadianceCacheConfig {
            clipmap_world_extent: 10.0,
            ..test_config()
        };
        let slots = SlotPool::new(16);
        let layout = CellLayout::new(8, 2);
        let old_levels = levels_at(Vec3::ZERO, &config);
        let new_levels = levels_at(Vec3::ZERO, &coarse);

        let old = ProbeIndirection::new(layout);
        for (coord, slot) in [(UVec3::splat(3), 3), (UVec3::splat(4), 4)] {
            bind(&old, &slots, layout.linear(0, coord), slot, 1);
        }
        let snapshot = old.snapshot();
        assert_eq!(snapshot.occupied(), 2);

        let index = ProbeIndirection::new(layout);
        index.reproject(&snapshot, &old_levels, &new_levels, &slots, 2, 3);

        let mut owners = std::collections::HashMap::new();
        for cell in index.cells_where(|state| state.slot().is_some()) {
            let slot = index.get(cell).slot().unwrap();
            assert!(owners.insert(slot, cell).is_none(), "slot {slot:?} aliased");
        }
    }

    #[test]
    fn test_reproject_requested_cell_wins_shared_slot() {
        // Halving the extent maps eight new cells onto the old center cell
        let config = test_config();
        let coarse = RadianceCacheConfig {
            clipmap_world_extent: 10.0,
            ..test_config()
        };
        let slots = SlotPool::new(16);
        let layout = CellLayout::new(8, 2);
        let old_levels = levels_at(Vec3::ZERO, &config);
        let new_levels = levels_at(Vec3::ZERO, &coarse);

        let old = ProbeIndirection::new(layout);
        bind(&old, &slots, layout.linear(0, UVec3::splat(4)), 4, 1);
        let snapshot = old.snapshot();
        assert_eq!(snapshot.occupied(), 1);

        // The requested cell sits after (3, 3, 3) in cell order
        let position = Vec3::splat(0.1);
        let requested = layout.linear(0, new_levels[0].cell_at(position).unwrap());
        let neighbor = layout.linear(0, UVec3::splat(3));
        assert!(neighbor < requested);

        let index = ProbeIndirection::new(layout);
        index.mark_requested(position, &new_levels);
        let report = index.reproject(&snapshot, &old_levels, &new_levels, &slots, 2, 3);

        assert_eq!(report, ReprojectionReport { reused: 1, retained: 0 });
        assert_eq!(index.get(requested), CellState::Resident(SlotId::new(4)));
        assert_eq!(index.get(neighbor), CellState::Empty);
        assert_eq!(slots.last_used_frame(SlotId::new(4)), 2);
        assert_eq!(index.snapshot().occupied(), 1);
    }
}

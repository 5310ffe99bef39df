//! Slot allocator
//!
//! Owns the slot pool and its free list. Binds free slots to pending cells
//! and reclaims slots whose probes went unrequested for too long.

use glam::Vec3;
use rayon::prelude::*;

use crate::clipmap::ClipmapLevel;
use crate::free_list::FreeList;
use crate::index::{CellState, ProbeIndirection};
use crate::slots::{SlotId, SlotPool};

/// Counters from one allocation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationReport {
    /// Pending cells that received a slot
    pub allocated: usize,
    /// Pending cells left unresolved because the free list ran dry
    pub failed: usize,
}

/// Fixed-capacity slot pool plus free list
#[derive(Debug)]
pub struct SlotAllocator {
    pool: SlotPool,
    free_list: FreeList,
}

impl SlotAllocator {
    /// Create an allocator with every slot free
    pub fn new(capacity: u32) -> Self {
        let mut allocator = Self {
            pool: SlotPool::new(capacity),
            free_list: FreeList::new(capacity),
        };
        allocator.seed();
        allocator
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut SlotPool {
        &mut self.pool
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Put every slot back on the free list and reset all aging counters
    pub fn seed(&mut self) {
        self.pool.reset();
        self.free_list.seed();
        tracing::debug!(capacity = self.pool.capacity(), "Seeded probe free list");
    }

    /// Reclaim slots that aged out or lost their cell
    ///
    /// Runs after reprojection. An active slot is released when
    /// `frame - last_used > max_age`, or when no cell claimed it this frame
    /// (its cell scrolled out of every level). A released slot's cell is
    /// cleared in `index`. Returns the number of released slots.
    pub fn release_stale(&self, index: &ProbeIndirection, frame: u32, max_age: u32) -> usize {
        (0..self.pool.capacity())
            .into_par_iter()
            .filter(|&raw| self.release_if_stale(index, SlotId::new(raw), frame, max_age))
            .count()
    }

    fn release_if_stale(
        &self,
        index: &ProbeIndirection,
        slot: SlotId,
        frame: u32,
        max_age: u32,
    ) -> bool {
        if !self.pool.is_active(slot) {
            return false;
        }
        let orphaned = self.pool.claimed_frame(slot) != frame;
        let stale = frame.wrapping_sub(self.pool.last_used_frame(slot)) > max_age;
        if !(orphaned || stale) {
            return false;
        }

        let owner = self.pool.owner(slot);
        if !self.pool.release(slot) {
            return false;
        }
        if let (false, Some(cell)) = (orphaned, owner) {
            index.compare_and_set(cell, CellState::Cached(slot), CellState::Empty);
        }
        self.free_list.push(slot);
        true
    }

    /// Bind a free slot to a pending cell
    ///
    /// No-op returning `false` if the cell isn't pending or the free list is
    /// empty; the cell then stays pending and is retried next frame.
    pub fn allocate(&self, index: &ProbeIndirection, cell: usize, frame: u32) -> bool {
        if index.get(cell) != CellState::Pending {
            return false;
        }
        let Some(slot) = self.free_list.pop() else {
            return false;
        };
        if !self.pool.activate(slot, cell, frame) {
            debug_assert!(false, "free list handed out non-free slot {}", slot.raw());
            return false;
        }
        index.set(cell, CellState::Resident(slot));
        true
    }

    /// Try to allocate every pending cell in parallel
    ///
    /// When pending cells outnumber free slots, the cells closest to the
    /// viewer win, ties broken by cell index. The rest stay pending.
    pub fn allocate_pending(
        &self,
        index: &ProbeIndirection,
        frame: u32,
        levels: &[ClipmapLevel],
        viewer: Vec3,
    ) -> AllocationReport {
        let mut pending = index.cells_where(|state| state == CellState::Pending);
        let free = self.free_list.len();

        let mut failed = 0;
        if pending.len() > free {
            let layout = index.layout();
            let mut by_distance: Vec<(f32, usize)> = pending
                .par_iter()
                .map(|&cell| {
                    let (level, coord) = layout.coord_of(cell);
                    let distance_squared = levels
                        .get(level as usize)
                        .map_or(f32::INFINITY, |clipmap| {
                            clipmap.cell_center(coord).distance_squared(viewer)
                        });
                    (distance_squared, cell)
                })
                .collect();
            by_distance.par_sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            failed = by_distance.len() - free;
            pending = by_distance.into_iter().take(free).map(|(_, cell)| cell).collect();
        }

        let (allocated, lost) = pending
            .into_par_iter()
            .map(|cell| {
                if self.allocate(index, cell, frame) {
                    (1, 0)
                } else {
                    (0, 1)
                }
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        AllocationReport {
            allocated,
            failed: failed + lost,
        }
    }

    /// Slots currently on the free list
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

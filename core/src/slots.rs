//! Probe slot pool
//!
//! Fixed-capacity arena of probe slots addressed by plain integer ids. A slot
//! id is only meaningful while the slot is `Active`; every use checks the
//! state. Aging counters live here, one atomic per slot, so per-slot passes
//! can run one worker per slot.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use glam::Vec3;
use rayon::prelude::*;

/// `last_traced_frame` of a slot that was never traced (frames start at 1)
pub const NEVER_TRACED: u32 = 0;

const NO_OWNER: u32 = u32::MAX;

const STATE_FREE: u8 = 0;
const STATE_RESERVED: u8 = 1;
const STATE_ACTIVE: u8 = 2;

/// Index of one probe slot in the atlas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Occupancy of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list
    Free,
    /// Popped from the free list, not yet bound to a cell
    Reserved,
    /// Bound to an indirection cell
    Active,
}

/// Per-slot occupancy and aging record
pub struct SlotPool {
    state: Vec<AtomicU8>,
    last_used_frame: Vec<AtomicU32>,
    last_traced_frame: Vec<AtomicU32>,
    allocated_frame: Vec<AtomicU32>,
    /// Frame in which a cell last took ownership (guards against aliasing)
    claimed_frame: Vec<AtomicU32>,
    owner_cell: Vec<AtomicU32>,
    /// Optional sub-cell jitter, persists until changed
    world_offset: Vec<Vec3>,
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("active", &self.active_count())
            .finish()
    }
}

fn atomics_u32(len: usize, value: u32) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(value)).collect()
}

impl SlotPool {
    /// Create a pool with every slot free
    pub fn new(capacity: u32) -> Self {
        let len = capacity as usize;
        Self {
            state: (0..len).map(|_| AtomicU8::new(STATE_FREE)).collect(),
            last_used_frame: atomics_u32(len, 0),
            last_traced_frame: atomics_u32(len, NEVER_TRACED),
            allocated_frame: atomics_u32(len, 0),
            claimed_frame: atomics_u32(len, 0),
            owner_cell: atomics_u32(len, NO_OWNER),
            world_offset: vec![Vec3::ZERO; len],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.state.len() as u32
    }

    /// Free every slot and reset all aging counters
    pub fn reset(&mut self) {
        for state in &mut self.state {
            *state.get_mut() = STATE_FREE;
        }
        for frames in [
            &mut self.last_used_frame,
            &mut self.last_traced_frame,
            &mut self.allocated_frame,
            &mut self.claimed_frame,
        ] {
            for frame in frames.iter_mut() {
                *frame.get_mut() = 0;
            }
        }
        for owner in &mut self.owner_cell {
            *owner.get_mut() = NO_OWNER;
        }
        self.world_offset.fill(Vec3::ZERO);
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        match self.state[slot.index()].load(Ordering::Acquire) {
            STATE_ACTIVE => SlotState::Active,
            STATE_RESERVED => SlotState::Reserved,
            _ => SlotState::Free,
        }
    }

    #[inline]
    pub fn is_active(&self, slot: SlotId) -> bool {
        self.state(slot) == SlotState::Active
    }

    #[inline]
    pub fn last_used_frame(&self, slot: SlotId) -> u32 {
        self.last_used_frame[slot.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_traced_frame(&self, slot: SlotId) -> u32 {
        self.last_traced_frame[slot.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn claimed_frame(&self, slot: SlotId) -> u32 {
        self.claimed_frame[slot.index()].load(Ordering::Relaxed)
    }

    /// Frame in which the slot was bound to its current cell
    #[inline]
    pub fn allocated_frame(&self, slot: SlotId) -> u32 {
        self.allocated_frame[slot.index()].load(Ordering::Relaxed)
    }

    /// Frames the slot has waited for a trace
    ///
    /// Counted from the last trace, or from allocation if it was never traced.
    pub fn frames_waiting(&self, slot: SlotId, frame: u32) -> u32 {
        self.frames_since_traced(slot, frame)
            .unwrap_or_else(|| frame.wrapping_sub(self.allocated_frame(slot)))
    }

    /// Frames since the slot's probe was last traced, `None` if never
    pub fn frames_since_traced(&self, slot: SlotId, frame: u32) -> Option<u32> {
        match self.last_traced_frame(slot) {
            NEVER_TRACED => None,
            traced => Some(frame.wrapping_sub(traced)),
        }
    }

    /// Cell currently owning the slot
    pub fn owner(&self, slot: SlotId) -> Option<usize> {
        match self.owner_cell[slot.index()].load(Ordering::Relaxed) {
            NO_OWNER => None,
            cell => Some(cell as usize),
        }
    }

    /// Record a request for the slot's probe this frame
    #[inline]
    pub fn touch(&self, slot: SlotId, frame: u32) {
        self.last_used_frame[slot.index()].store(frame, Ordering::Relaxed);
    }

    /// Record that the slot's probe was handed to the tracer this frame
    #[inline]
    pub fn mark_traced(&self, slot: SlotId, frame: u32) {
        self.last_traced_frame[slot.index()].store(frame, Ordering::Relaxed);
    }

    /// Take ownership of an active slot for `cell` this frame
    ///
    /// Only the first claim per frame succeeds, so one slot can never end up
    /// in two cells even when several cells reproject onto the same
    /// previous cell.
    pub fn claim(&self, slot: SlotId, cell: usize, frame: u32) -> bool {
        if !self.is_active(slot) {
            return false;
        }
        if self.claimed_frame[slot.index()].swap(frame, Ordering::AcqRel) == frame {
            return false;
        }
        self.owner_cell[slot.index()].store(cell as u32, Ordering::Relaxed);
        true
    }

    /// Bind a free slot to `cell`, starting its aging at `frame`
    ///
    /// Returns `false` if the slot was not free.
    pub fn activate(&self, slot: SlotId, cell: usize, frame: u32) -> bool {
        let index = slot.index();
        if self.state[index]
            .compare_exchange(
                STATE_FREE,
                STATE_RESERVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }

        self.last_used_frame[index].store(frame, Ordering::Relaxed);
        self.last_traced_frame[index].store(NEVER_TRACED, Ordering::Relaxed);
        self.allocated_frame[index].store(frame, Ordering::Relaxed);
        self.claimed_frame[index].store(frame, Ordering::Relaxed);
        self.owner_cell[index].store(cell as u32, Ordering::Relaxed);
        self.state[index].store(STATE_ACTIVE, Ordering::Release);
        true
    }

    /// Return an active slot to the free state
    ///
    /// Returns `false` if the slot was not active (already released).
    pub fn release(&self, slot: SlotId) -> bool {
        let released = self.state[slot.index()]
            .compare_exchange(
                STATE_ACTIVE,
                STATE_FREE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if released {
            self.owner_cell[slot.index()].store(NO_OWNER, Ordering::Relaxed);
        }
        released
    }

    pub fn world_offset(&self, slot: SlotId) -> Vec3 {
        self.world_offset[slot.index()]
    }

    pub fn set_world_offset(&mut self, slot: SlotId, offset: Vec3) {
        self.world_offset[slot.index()] = offset;
    }

    /// Number of active slots
    pub fn active_count(&self) -> usize {
        self.state
            .par_iter()
            .filter(|state| state.load(Ordering::Relaxed) == STATE_ACTIVE)
            .count()
    }
}

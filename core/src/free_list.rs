//! Lock-free free list of probe slots
//!
//! Array-backed stack with an atomic top cursor. Within one pass workers
//! either all pop (allocation) or all push (release); the two never mix in
//! the same pass.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use rayon::prelude::*;

use crate::slots::SlotId;

/// Stack of free slot ids shared by many parallel workers
pub struct FreeList {
    entries: Vec<AtomicU32>,
    top: AtomicI64,
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.entries.len())
            .field("len", &self.len())
            .finish()
    }
}

impl FreeList {
    /// Create an empty free list able to hold `capacity` ids
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            top: AtomicI64::new(0),
        }
    }

    /// Fill with every slot id; slot 0 is popped first
    pub fn seed(&self) {
        let capacity = self.entries.len();
        self.entries
            .par_iter()
            .enumerate()
            .for_each(|(i, entry)| entry.store((capacity - 1 - i) as u32, Ordering::Relaxed));
        self.top.store(capacity as i64, Ordering::Release);
    }

    /// Take one free slot, or `None` when exhausted
    pub fn pop(&self) -> Option<SlotId> {
        let previous = self.top.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            // Undo: the list was already empty
            self.top.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        let raw = self.entries[(previous - 1) as usize].load(Ordering::Relaxed);
        Some(SlotId::new(raw))
    }

    /// Return a slot to the list
    pub fn push(&self, slot: SlotId) {
        let index = self.top.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            index >= 0 && (index as usize) < self.entries.len(),
            "free list overflow: slot {} pushed twice?",
            slot.raw()
        );
        self.entries[index as usize].store(slot.raw(), Ordering::Relaxed);
    }

    /// Number of free ids
    pub fn len(&self) -> usize {
        self.top.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

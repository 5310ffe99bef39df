//! Radiance Cache Core - world-space radiance probe caching
//!
//! Keeps a bounded set of radiance probes alive across frames around a
//! moving viewer and decides, under a fixed per-frame budget, which of them
//! get (re)traced.
//!
//! # Architecture
//!
//! - [`ClipmapState`] - Nested viewer-centered grids, re-snapped every frame
//! - [`ProbeIndirection`] - Per-frame cell to slot mapping, seeded by reprojection
//! - [`SlotAllocator`] - Fixed slot pool with a lock-free free list and aging
//! - [`PriorityScheduler`] - Histogram budget selection of the trace work-list
//! - [`RadianceCache`] - Runs the passes in order once per frame
//!
//! Every pass is data-parallel (rayon) with one logical worker per cell or
//! slot; workers share state only through atomics.

pub mod allocator;
pub mod cache;
pub mod clipmap;
pub mod config;
pub mod error;
pub mod free_list;
pub mod index;
pub mod scheduler;
pub mod slots;

pub use allocator::{AllocationReport, SlotAllocator};
pub use cache::{FrameOutput, FrameSnapshot, FrameStats, ProbeLookup, RadianceCache};
pub use clipmap::{ClipmapGpuParams, ClipmapLevel, ClipmapState};
pub use config::{
    MAX_CLIPMAP_RESOLUTION, MAX_CLIPMAPS, MAX_PRIORITY_HISTOGRAM_SIZE, MAX_PROBE_SLOTS,
    RadianceCacheConfig, ResetPolicy,
};
pub use error::ConfigError;
pub use free_list::FreeList;
pub use index::{CellLayout, CellState, IndirectionSnapshot, ProbeIndirection, ReprojectionReport};
pub use scheduler::{
    DistanceStalenessPolicy, PriorityHistogram, PriorityInput, PriorityPolicy, PriorityScheduler,
    SchedulingView, Threshold, TraceDetail, TraceWorkItem,
};
pub use slots::{NEVER_TRACED, SlotId, SlotPool, SlotState};

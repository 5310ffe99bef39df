//! Priority budget scheduler
//!
//! Picks which resident probes get (re)traced this frame without ever
//! exceeding the trace budget:
//!
//! 1. [`PriorityScheduler::build_histogram`] buckets every resident probe
//!    that has no trace result for the current frame.
//! 2. [`PriorityScheduler::select_threshold`] walks buckets from most to
//!    least urgent and finds the bucket where the budget runs out.
//! 3. [`PriorityScheduler::emit_work_list`] admits everything above that
//!    bucket, the longest-waiting candidates from inside it up to the residual
//!    budget, and defers the rest.
//!
//! Bucket scoring is a policy ([`PriorityPolicy`]); the default favours
//! close and stale probes.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;
use rayon::prelude::*;

use crate::clipmap::ClipmapLevel;
use crate::index::{CellState, ProbeIndirection};
use crate::slots::{SlotId, SlotPool};

/// What a priority policy knows about one probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInput {
    /// Clipmap level the probe lives on
    pub level: u32,
    /// World distance from the viewer to the probe
    pub distance_to_viewer: f32,
    /// Distance in units of the finest clipmap extent
    pub normalized_distance: f32,
    /// Frames since the probe was last traced, `None` for new probes
    pub frames_since_traced: Option<u32>,
    /// Frames since the last trace, or since allocation if never traced
    pub frames_waiting: u32,
}

/// Maps a probe to a priority bucket
///
/// Must be deterministic within a frame: the histogram pass and the
/// emission pass score every probe twice and rely on getting the same
/// bucket. Higher buckets are more urgent.
pub trait PriorityPolicy: Send + Sync {
    /// Bucket in `0..histogram_size`
    fn score_priority(&self, input: &PriorityInput, histogram_size: u32) -> u32;
}

/// Default policy: staleness scaled down by distance from the viewer
///
/// Every probe gains [`SCORE_PER_STALE_FRAME`](Self::SCORE_PER_STALE_FRAME)
/// per frame it waits; new probes also get a full histogram's worth of score
/// on top. The score is divided by `1 + normalized_distance`. Waiting always
/// raises the score, so anything deferred reaches the top bucket eventually
/// no matter how far away it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistanceStalenessPolicy;

impl DistanceStalenessPolicy {
    pub const SCORE_PER_STALE_FRAME: f32 = 4.0;
}

impl PriorityPolicy for DistanceStalenessPolicy {
    fn score_priority(&self, input: &PriorityInput, histogram_size: u32) -> u32 {
        let first_trace_bonus = match input.frames_since_traced {
            None => histogram_size as f32,
            Some(_) => 0.0,
        };
        let staleness =
            first_trace_bonus + input.frames_waiting as f32 * Self::SCORE_PER_STALE_FRAME;
        let weight = 1.0 / (1.0 + input.normalized_distance.max(0.0));
        let score = (staleness * weight).floor() as u32;
        score.min(histogram_size.saturating_sub(1))
    }
}

/// Trace resolution hint derived from distance to the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDetail {
    /// Closer than the supersample distance
    Supersample,
    Normal,
    /// Farther than the downsample distance
    Downsample,
}

impl TraceDetail {
    pub fn for_distance(distance: f32, supersample_distance: f32, downsample_distance: f32) -> Self {
        if distance < supersample_distance {
            TraceDetail::Supersample
        } else if distance > downsample_distance {
            TraceDetail::Downsample
        } else {
            TraceDetail::Normal
        }
    }
}

/// One probe handed to the trace/shade consumer this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceWorkItem {
    pub slot: SlotId,
    pub level: u32,
    /// Probe world position (cell center plus slot jitter)
    pub position: Vec3,
    /// Bucket the probe was admitted from
    pub priority: u32,
    pub detail: TraceDetail,
    /// Minimum ray distance for the probe's level
    pub min_trace_distance: f32,
}

/// Bucket at which the budget runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    /// Buckets above this are admitted unconditionally
    pub bucket: u32,
    /// How many probes from `bucket` itself may still be admitted
    pub admitted_from_bucket: u32,
}

/// What the threshold decides for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Above the threshold
    Admitted,
    /// In the threshold bucket, competing for the residual quota
    Contending,
    /// Below the threshold, left for a later frame
    Deferred,
}

impl Threshold {
    pub fn admission(&self, bucket: u32) -> Admission {
        match bucket.cmp(&self.bucket) {
            std::cmp::Ordering::Greater => Admission::Admitted,
            std::cmp::Ordering::Equal => Admission::Contending,
            std::cmp::Ordering::Less => Admission::Deferred,
        }
    }
}

/// Fixed-size histogram of pending trace priorities
pub struct PriorityHistogram {
    counts: Vec<AtomicU32>,
}

impl std::fmt::Debug for PriorityHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityHistogram")
            .field("buckets", &self.counts.len())
            .finish()
    }
}

impl PriorityHistogram {
    pub fn new(size: u32) -> Self {
        Self {
            counts: (0..size).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn size(&self) -> u32 {
        self.counts.len() as u32
    }

    pub fn clear(&self) {
        self.counts
            .par_iter()
            .for_each(|count| count.store(0, Ordering::Relaxed));
    }

    #[inline]
    pub fn add(&self, bucket: u32) {
        self.counts[bucket as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, bucket: u32) -> u32 {
        self.counts[bucket as usize].load(Ordering::Relaxed)
    }

    /// Snapshot of every bucket count, lowest priority first
    pub fn counts(&self) -> Vec<u32> {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect()
    }

    /// Find the bucket where cumulative counts (from the top) exceed `budget`
    ///
    /// If everything fits, the threshold is bucket 0 with all of its probes
    /// admitted.
    pub fn select_threshold(&self, budget: u32) -> Threshold {
        let mut cumulative = 0u32;
        for bucket in (0..self.size()).rev() {
            let count = self.count(bucket);
            if cumulative.saturating_add(count) > budget {
                return Threshold {
                    bucket,
                    admitted_from_bucket: budget - cumulative,
                };
            }
            cumulative += count;
        }

        Threshold {
            bucket: 0,
            admitted_from_bucket: self.counts.first().map_or(0, |c| c.load(Ordering::Relaxed)),
        }
    }
}

/// Read-only frame state the scheduler scores against
#[derive(Debug, Clone, Copy)]
pub struct SchedulingView<'a> {
    pub index: &'a ProbeIndirection,
    pub levels: &'a [ClipmapLevel],
    pub slots: &'a SlotPool,
    pub viewer: Vec3,
    pub frame: u32,
    pub first_clipmap_extent_rcp: f32,
    pub supersample_distance: f32,
    pub downsample_distance: f32,
}

struct TraceCandidate {
    slot: SlotId,
    level: u32,
    position: Vec3,
    distance: f32,
    bucket: u32,
    waiting: u32,
}

/// Histogram plus scoring policy
pub struct PriorityScheduler {
    histogram: PriorityHistogram,
    policy: Box<dyn PriorityPolicy>,
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("histogram", &self.histogram)
            .finish_non_exhaustive()
    }
}

impl PriorityScheduler {
    pub fn new(histogram_size: u32, policy: Box<dyn PriorityPolicy>) -> Self {
        Self {
            histogram: PriorityHistogram::new(histogram_size),
            policy,
        }
    }

    pub fn histogram(&self) -> &PriorityHistogram {
        &self.histogram
    }

    pub fn set_policy(&mut self, policy: Box<dyn PriorityPolicy>) {
        self.policy = policy;
    }

    /// Replace the histogram with an empty one of `size` buckets, keeping the policy
    pub fn resize_histogram(&mut self, size: u32) {
        self.histogram = PriorityHistogram::new(size);
    }

    /// Score a resident probe lacking a trace for the current frame
    fn candidate(&self, view: &SchedulingView<'_>, cell: usize) -> Option<TraceCandidate> {
        let CellState::Resident(slot) = view.index.get(cell) else {
            return None;
        };
        if view.slots.last_traced_frame(slot) == view.frame {
            return None;
        }

        let (level, coord) = view.index.layout().coord_of(cell);
        let clipmap = view.levels.get(level as usize)?;
        let position = clipmap.cell_center(coord) + view.slots.world_offset(slot);
        let distance = position.distance(view.viewer);

        let waiting = view.slots.frames_waiting(slot, view.frame);
        let input = PriorityInput {
            level,
            distance_to_viewer: distance,
            normalized_distance: distance * view.first_clipmap_extent_rcp,
            frames_since_traced: view.slots.frames_since_traced(slot, view.frame),
            frames_waiting: waiting,
        };
        let bucket = self
            .policy
            .score_priority(&input, self.histogram.size())
            .min(self.histogram.size().saturating_sub(1));

        Some(TraceCandidate {
            slot,
            level,
            position,
            distance,
            bucket,
            waiting,
        })
    }

    /// Clear and rebuild the histogram; returns the number of candidates
    pub fn build_histogram(&self, view: &SchedulingView<'_>) -> usize {
        self.histogram.clear();
        (0..view.index.cell_count())
            .into_par_iter()
            .filter_map(|cell| self.candidate(view, cell))
            .map(|candidate| self.histogram.add(candidate.bucket))
            .count()
    }

    /// Threshold for this frame's budget
    pub fn select_threshold(&self, budget: u32) -> Threshold {
        self.histogram.select_threshold(budget)
    }

    /// Admit probes against `threshold` and build the trace work-list
    ///
    /// Probes in the threshold bucket are admitted longest-waiting first (ties
    /// by slot id) up to the residual budget, so a probe that keeps losing
    /// only has to wait for the finitely many probes that waited longer.
    /// Admitted probes are stamped as traced this frame. The list is sorted
    /// by priority (highest first), then slot id.
    pub fn emit_work_list(
        &self,
        view: &SchedulingView<'_>,
        threshold: Threshold,
    ) -> Vec<TraceWorkItem> {
        let cells = 0..view.index.cell_count();
        let (admitted, mut contending): (Vec<TraceCandidate>, Vec<TraceCandidate>) = cells
            .into_par_iter()
            .filter_map(|cell| self.candidate(view, cell))
            .filter(|candidate| threshold.admission(candidate.bucket) != Admission::Deferred)
            .partition(|candidate| threshold.admission(candidate.bucket) == Admission::Admitted);

        contending.sort_unstable_by(|a, b| b.waiting.cmp(&a.waiting).then(a.slot.cmp(&b.slot)));
        contending.truncate(threshold.admitted_from_bucket as usize);

        let mut work_list: Vec<TraceWorkItem> = admitted
            .into_par_iter()
            .chain(contending)
            .map(|candidate| {
                view.slots.mark_traced(candidate.slot, view.frame);
                let clipmap = &view.levels[candidate.level as usize];
                TraceWorkItem {
                    slot: candidate.slot,
                    level: candidate.level,
                    position: candidate.position,
                    priority: candidate.bucket,
                    detail: TraceDetail::for_distance(
                        candidate.distance,
                        view.supersample_distance,
                        view.downsample_distance,
                    ),
                    min_trace_distance: clipmap.min_trace_distance,
                }
            })
            .collect();

        work_list.sort_unstable_by(|a, b| b.priority.cmp(&a.priority).then(a.slot.cmp(&b.slot)));
        work_list
    }
}

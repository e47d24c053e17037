//! Collection statistics: per-phase wall times, slice records, counters.
//!
//! Numbers only — the embedding decides what to do with them. Summaries go
//! to the `log` crate at debug level.

use std::time::{Duration, Instant};

use super::driver::{GcReason, State};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    MinorGc,
    MarkRoots,
    Mark,
    Sweep,
    Finalize,
    Compact,
    Decommit,
}

pub const PHASE_COUNT: usize = 7;

#[derive(Clone, Debug)]
pub struct SliceRecord {
    pub reason: GcReason,
    pub begin_state: State,
    pub end_state: State,
    pub duration: Duration,
}

pub struct Statistics {
    phase_times: [Duration; PHASE_COUNT],
    phase_stack: Vec<(Phase, Instant)>,
    pub slices: Vec<SliceRecord>,
    slice_start: Option<(GcReason, State, Instant)>,

    pub minor_collections: usize,
    pub major_collections: usize,
    pub cells_tenured: usize,
    pub bytes_tenured: usize,
    pub cells_finalized: usize,
    pub regions_relocated: usize,
    pub resets: usize,
}

impl Statistics {
    pub fn new() -> Statistics {
        Statistics {
            phase_times: [Duration::ZERO; PHASE_COUNT],
            phase_stack: Vec::new(),
            slices: Vec::new(),
            slice_start: None,
            minor_collections: 0,
            major_collections: 0,
            cells_tenured: 0,
            bytes_tenured: 0,
            cells_finalized: 0,
            regions_relocated: 0,
            resets: 0,
        }
    }

    pub fn begin_phase(&mut self, phase: Phase) {
        self.phase_stack.push((phase, Instant::now()));
    }

    pub fn end_phase(&mut self, phase: Phase) {
        if let Some((started, at)) = self.phase_stack.pop() {
            debug_assert_eq!(started, phase);
            self.phase_times[phase as usize] += at.elapsed();
        }
    }

    pub fn phase_time(&self, phase: Phase) -> Duration {
        self.phase_times[phase as usize]
    }

    pub fn begin_slice(&mut self, reason: GcReason, state: State) {
        self.slice_start = Some((reason, state, Instant::now()));
    }

    pub fn end_slice(&mut self, end_state: State) {
        if let Some((reason, begin_state, at)) = self.slice_start.take() {
            let duration = at.elapsed();
            log::debug!(
                "gc slice: {:?} {:?} -> {:?} in {:?}",
                reason,
                begin_state,
                end_state,
                duration
            );
            self.slices.push(SliceRecord {
                reason,
                begin_state,
                end_state,
                duration,
            });
        }
    }

    pub fn note_minor_gc(
        &mut self,
        reason: GcReason,
        nursery_bytes: usize,
        cells_tenured: usize,
        bytes_tenured: usize,
    ) {
        self.minor_collections += 1;
        self.cells_tenured += cells_tenured;
        self.bytes_tenured += bytes_tenured;
        log::debug!(
            "minor gc done: reason {:?}, {} of {} nursery bytes tenured ({} cells)",
            reason,
            bytes_tenured,
            nursery_bytes,
            cells_tenured
        );
    }

    pub fn note_major_gc_finished(&mut self) {
        self.major_collections += 1;
        self.slices.clear();
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time heap numbers, the teacher-style stats surface.
#[derive(Clone, Debug)]
pub struct GcStats {
    pub allocated_bytes: usize,
    pub heap_bytes: usize,
    pub live_regions: usize,
    pub minor_collections: usize,
    pub major_collections: usize,
}

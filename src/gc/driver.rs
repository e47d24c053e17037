//! The incremental driver: a state machine over slices.
//!
//! ```text
//! NotActive → MarkRoots → Mark → Sweep → Finalize → Compact → Decommit → NotActive
//! ```
//!
//! A slice runs until its budget (time or work units) is exhausted, then
//! parks enough state to resume: the marker keeps its stack (value arrays
//! saved to index form), sweeping keeps its group/phase/zone/action
//! cursor, compaction keeps its zone cursor. Any state can be reset to
//! `NotActive` on a hard blocker; a reset that lands mid-sweep completes
//! the current sweep group first.

use std::time::{Duration, Instant};

use super::atom_marking::update_atom_marking;
use super::cell::CellColor;
use super::marking::GcMarker;
use super::runtime::{FinalizePhase, GcRuntime, HeapState};
use super::statistics::Phase;
use super::sweep_groups::find_sweep_groups;
use super::zone::{Zone, ZoneGcState};
use crate::options::ZealMode;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    NotActive,
    MarkRoots,
    Mark,
    Sweep,
    Finalize,
    Compact,
    Decommit,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcReason {
    Api,
    MaybeGc,
    AllocTrigger,
    OutOfNursery,
    LastDitch,
    TooMuchMalloc,
    FullStoreBuffer,
    EvictNursery,
    DebugGc,
    CompartmentRevived,
    Zeal,
    Shutdown,
}

/// Why an incremental collection was abandoned.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AbortReason {
    NonIncrementalRequested,
    AbortRequested,
    IncrementalDisabled,
    ModeChange,
    MallocBytesTrigger,
    GcBytesTrigger,
    ZoneChange,
    CompartmentRevived,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IncrementalProgress {
    NotFinished,
    Finished,
}

/// A slice's allowance: wall-clock deadline, work units, or unlimited.
/// Work is counted in mark-stack pops and cells swept.
pub struct SliceBudget {
    deadline: Option<Instant>,
    work: Option<i64>,
    counter: i64,
    steps_since_check: u32,
}

/// How often a time budget consults the clock.
const STEPS_PER_TIME_CHECK: u32 = 256;

impl SliceBudget {
    pub fn unlimited() -> SliceBudget {
        SliceBudget {
            deadline: None,
            work: None,
            counter: 0,
            steps_since_check: 0,
        }
    }

    pub fn work(units: i64) -> SliceBudget {
        SliceBudget {
            deadline: None,
            work: Some(units),
            counter: 0,
            steps_since_check: 0,
        }
    }

    pub fn time(duration: Duration) -> SliceBudget {
        SliceBudget {
            deadline: Some(Instant::now() + duration),
            work: None,
            counter: 0,
            steps_since_check: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.deadline.is_none() && self.work.is_none()
    }

    /// Consume `units` of budget; true means the slice should yield.
    pub fn step(&mut self, units: i64) -> bool {
        self.counter += units;
        self.is_over_budget()
    }

    pub fn is_over_budget(&mut self) -> bool {
        if let Some(limit) = self.work {
            if self.counter >= limit {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            self.steps_since_check += 1;
            if self.steps_since_check >= STEPS_PER_TIME_CHECK {
                self.steps_since_check = 0;
                return Instant::now() >= deadline;
            }
        }
        false
    }
}

impl GcRuntime {
    /// Full synchronous collection.
    pub fn gc(&mut self, reason: GcReason) {
        self.run_slice(reason, SliceBudget::unlimited());
        debug_assert!(!self.is_incremental_gc_in_progress());
    }

    /// Full synchronous collection with compaction forced on.
    pub fn compacting_gc(&mut self, reason: GcReason) {
        self.compact_all_requested = true;
        self.gc(reason);
    }

    /// Begin an incremental collection. No-op if one is already running.
    pub fn start_gc(&mut self, reason: GcReason, budget: SliceBudget) {
        if self.is_incremental_gc_in_progress() {
            return;
        }
        self.run_slice(reason, budget);
    }

    /// Advance the current collection (or start one).
    pub fn gc_slice(&mut self, reason: GcReason, budget: SliceBudget) {
        self.run_slice(reason, budget);
    }

    /// Run the current collection to completion.
    pub fn finish_gc(&mut self, reason: GcReason) {
        if self.is_incremental_gc_in_progress() {
            self.run_slice(reason, SliceBudget::unlimited());
        }
    }

    /// External abort. Marking state is discarded; a sweep in progress
    /// finishes its current group first.
    pub fn abort_gc(&mut self) {
        self.abort_requested = true;
        self.reset_incremental(AbortReason::AbortRequested);
        self.abort_requested = false;
    }

    fn run_slice(&mut self, reason: GcReason, mut budget: SliceBudget) {
        if self.heap_state() != HeapState::Idle {
            return;
        }
        self.stats.begin_slice(reason, self.incremental_state);
        let prev = self.set_heap_state(HeapState::MajorCollecting);
        self.call_slice_callback();
        unsafe {
            self.incremental_slice(&mut budget, reason);
        }
        self.set_heap_state(prev);
        self.stats.end_slice(self.incremental_state);
        self.call_slice_callback();
    }

    unsafe fn incremental_slice(&mut self, budget: &mut SliceBudget, reason: GcReason) {
        // Hard blockers are checked between slices, never mid-phase.
        if self.is_incremental_gc_in_progress() {
            let mut blocked = false;
            self.for_each_zone(|zone| {
                if (*zone).destroy_scheduled {
                    blocked = true;
                }
            });
            if blocked {
                self.reset_incremental(AbortReason::ZoneChange);
            }
        }

        loop {
            match self.incremental_state {
                State::NotActive => {
                    self.begin_collection(reason);
                    // The first slice is always consumed by root marking.
                }
                State::MarkRoots => {
                    self.stats.begin_phase(Phase::MarkRoots);
                    self.mark_runtime_roots();
                    self.stats.end_phase(Phase::MarkRoots);
                    self.incremental_state = State::Mark;
                    if !budget.is_unlimited()
                        && !self.has_zeal(ZealMode::IncrementalRootsThenFinish)
                    {
                        return;
                    }
                }
                State::Mark => {
                    self.stats.begin_phase(Phase::Mark);
                    let finished = {
                        let marker = &mut self.marker as *mut GcMarker;
                        if self.has_zeal(ZealMode::IncrementalMarkAllThenFinish) {
                            let mut unlimited = SliceBudget::unlimited();
                            (*marker).mark_until_budget_exhausted(&mut unlimited)
                        } else {
                            (*marker).mark_until_budget_exhausted(budget)
                        }
                    };
                    self.stats.end_phase(Phase::Mark);
                    if !finished {
                        // The mutator may reallocate slot buffers before the
                        // next slice; pointer-form entries must not survive.
                        self.marker.save_value_arrays();
                        return;
                    }
                    self.finish_marking();
                    self.begin_sweeping();
                    self.incremental_state = State::Sweep;
                }
                State::Sweep => {
                    self.stats.begin_phase(Phase::Sweep);
                    let progress = self.perform_sweep_actions(budget);
                    self.stats.end_phase(Phase::Sweep);
                    if progress == IncrementalProgress::NotFinished {
                        return;
                    }
                    self.incremental_state = State::Finalize;
                }
                State::Finalize => {
                    self.stats.begin_phase(Phase::Finalize);
                    self.finish_sweeping();
                    self.stats.end_phase(Phase::Finalize);
                    let compact = self.params.compacting
                        && (self.compact_all_requested || self.has_zeal(ZealMode::Compact));
                    self.incremental_state = if compact {
                        State::Compact
                    } else {
                        State::Decommit
                    };
                }
                State::Compact => {
                    self.stats.begin_phase(Phase::Compact);
                    let progress = self.compact_phase(budget);
                    self.stats.end_phase(Phase::Compact);
                    if progress == IncrementalProgress::NotFinished {
                        return;
                    }
                    self.incremental_state = State::Decommit;
                }
                State::Decommit => {
                    self.stats.begin_phase(Phase::Decommit);
                    let rt = self as *mut GcRuntime;
                    self.with_gc_lock(|| {
                        (*rt).region_pool_mut().decommit_free_regions();
                    });
                    self.stats.end_phase(Phase::Decommit);
                    self.end_collection();
                    self.incremental_state = State::NotActive;
                    return;
                }
            }
        }
    }

    unsafe fn begin_collection(&mut self, reason: GcReason) {
        log::debug!("gc {} begin: reason {:?}", self.gc_number + 1, reason);
        self.gc_number += 1;
        self.is_full = true;

        // Work on a quiescent young generation: evict every nursery so the
        // mark phase sees only tenured cells.
        let prev = self.set_heap_state(HeapState::Idle);
        self.evict_nursery(GcReason::EvictNursery);
        self.set_heap_state(prev);

        // Schedule and prepare every zone: drop stale marks, reset the atom
        // interest bitmaps that marking will rebuild.
        self.atom_marking.roots_bitmap.clear();
        self.for_each_zone(|zone| {
            (*zone).scheduled = true;
            (*zone).state = ZoneGcState::MarkBlack;
            if !(*zone).is_atoms_zone {
                (*zone).atom_bitmap.clear();
            }
            for kind in super::kinds::AllocKind::ALL {
                for region in (*zone).iter_regions(kind) {
                    for cell in (*region).iter_cells() {
                        (*cell).unmark();
                    }
                }
            }
        });

        self.marker.start();
        if self.has_zeal(ZealMode::VerifierPre) {
            super::verifier::start_pre_barrier_verifier(self);
        }
        self.incremental_state = State::MarkRoots;
    }

    unsafe fn mark_runtime_roots(&mut self) {
        let rt = self as *mut GcRuntime;
        let marker = &mut (*rt).marker as *mut GcMarker;
        (*marker).set_color(CellColor::Black);
        (*rt).trace_black_roots(&mut *marker);
    }

    /// Everything that happens between "mark stack drained" and "sweeping
    /// begins": weak-marking, gray roots, incoming gray lists, atom bitmap
    /// refinement, and the barrier verifier's end check.
    unsafe fn finish_marking(&mut self) {
        let rt = self as *mut GcRuntime;
        let marker = &mut (*rt).marker as *mut GcMarker;
        let mut unlimited = SliceBudget::unlimited();

        // Weak maps: propagate through marked keys until a fixpoint.
        let zones = (*rt).collecting_zones();
        (*marker).enter_weak_marking_mode(&zones);
        (*marker).mark_until_budget_exhausted(&mut unlimited);

        // Gray roots (the cycle collector's view).
        (*marker).set_color(CellColor::Gray);
        (*rt).trace_gray_roots(&mut *marker);
        (*marker).mark_until_budget_exhausted(&mut unlimited);

        // Incoming gray wrappers recorded during gray marking: follow them
        // now, within their own groups.
        loop {
            let mut wrappers = Vec::new();
            for &zone in &zones {
                for compartment in (*zone).compartments.iter_mut() {
                    wrappers.append(&mut compartment.incoming_gray);
                }
            }
            if wrappers.is_empty() {
                break;
            }
            for wrapper in wrappers {
                if let Some(target) = (*wrapper).wrapper_target() {
                    (*marker).mark_root_cell(target);
                }
            }
            (*marker).mark_until_budget_exhausted(&mut unlimited);
        }

        (*marker).set_color(CellColor::Black);
        (*marker).leave_weak_marking_mode();

        // I7: atoms survive iff some live zone's bitmap names them.
        update_atom_marking(self);

        if self.verify_snapshot.is_some() {
            super::verifier::end_pre_barrier_verifier(self);
        }
    }

    unsafe fn begin_sweeping(&mut self) {
        let mut zones = Vec::new();
        let mut atoms: Option<*mut Zone> = None;
        self.for_each_zone(|zone| {
            if !(*zone).is_collecting() {
                return;
            }
            if (*zone).is_atoms_zone {
                atoms = Some(zone);
            } else {
                zones.push(zone);
            }
        });
        self.sweep_groups = find_sweep_groups(&zones);
        if let Some(atoms_zone) = atoms {
            // The atoms zone depends on every other zone's bitmap; it sweeps
            // last, alone.
            (*atoms_zone).next_in_sweep_group = std::ptr::null_mut();
            self.sweep_groups.push(vec![atoms_zone]);
        }
        self.current_sweep_group = 0;
        self.sweep_phase_index = 0;
        self.sweep_zone_index = 0;
        self.sweep_action_index = 0;
        self.compact_zone_cursor = 0;
        // Tables keyed on cells are swept up front, while every header is
        // still readable.
        self.sweep_misc_all();
        log::debug!("sweep: {} groups", self.sweep_groups.len());
    }

    unsafe fn end_collection(&mut self) {
        debug_assert!(self.marker.is_drained());
        self.for_each_zone(|zone| {
            (*zone).state = ZoneGcState::NoGc;
            (*zone).scheduled = false;
            (*zone).update_trigger_after_gc();
        });
        self.compact_all_requested = false;
        self.sweep_groups.clear();
        self.stats.note_major_gc_finished();
        self.call_finalize_callbacks(FinalizePhase::CollectionEnd);
        if self.has_zeal(ZealMode::CheckHeapAfterGc) {
            super::verifier::check_heap(self);
        }
        log::debug!(
            "gc {} end: {} cells marked",
            self.gc_number,
            self.marker.cells_marked
        );
    }

    /// Abandon the incremental collection. Marking state is discarded; a
    /// reset landing mid-sweep first completes the current sweep group
    /// (finalized cells must not be resurrected by a later GC).
    pub fn reset_incremental(&mut self, reason: AbortReason) {
        if !self.is_incremental_gc_in_progress() {
            return;
        }
        log::debug!("incremental gc reset: {:?}", reason);
        unsafe {
            match self.incremental_state {
                State::MarkRoots | State::Mark => {
                    self.marker.reset();
                    self.verify_snapshot = None;
                }
                State::Sweep => {
                    let mut unlimited = SliceBudget::unlimited();
                    self.sweep_current_group_to_end(&mut unlimited);
                    self.finish_sweeping();
                }
                State::Finalize | State::Compact | State::Decommit => {
                    // Past sweeping there is nothing incremental left to
                    // abandon; just run it down.
                    let prev = self.set_heap_state(HeapState::MajorCollecting);
                    let mut unlimited = SliceBudget::unlimited();
                    self.incremental_slice(&mut unlimited, GcReason::Api);
                    self.set_heap_state(prev);
                    self.stats.resets += 1;
                    self.last_abort = Some(reason);
                    return;
                }
                State::NotActive => return,
            }
            self.for_each_zone(|zone| {
                if (*zone).is_collecting() {
                    (*zone).state = ZoneGcState::NoGc;
                    (*zone).scheduled = false;
                }
            });
        }
        self.sweep_groups.clear();
        self.incremental_state = State::NotActive;
        self.stats.resets += 1;
        self.last_abort = Some(reason);
    }

    pub fn last_abort_reason(&self) -> Option<AbortReason> {
        self.last_abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_budget_counts_steps() {
        let mut budget = SliceBudget::work(10);
        for _ in 0..9 {
            assert!(!budget.step(1));
        }
        assert!(budget.step(1));
        assert!(budget.is_over_budget());
    }

    #[test]
    fn unlimited_budget_never_expires() {
        let mut budget = SliceBudget::unlimited();
        assert!(!budget.step(1_000_000));
        assert!(budget.is_unlimited());
    }

    #[test]
    fn time_budget_expires() {
        let mut budget = SliceBudget::time(Duration::from_millis(0));
        let mut over = false;
        for _ in 0..10_000 {
            if budget.step(1) {
                over = true;
                break;
            }
        }
        assert!(over, "a zero-duration budget must expire");
    }
}

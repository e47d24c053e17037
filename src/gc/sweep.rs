//! Sweeping: phase/action tables, per-zone per-kind finalization, and the
//! background finalization helper.
//!
//! The sweep schedule is data: a list of phases, each a list of
//! `(func, kind)` actions, computed once at startup. The driver iterates
//! groups × phases × zones × actions and can stop between any zone or
//! action, resuming from the recorded indices. Kinds whose finalizers are
//! thread-safe are handed to the helper thread; the mutator resumes while
//! it works, and the next slice (or any allocation that needs those
//! regions) waits on its condition variable first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use super::cell::CellHeader;
use super::cells::finalize_cell;
use super::driver::{IncrementalProgress, SliceBudget};
use super::kinds::{is_background_finalizable, size_of_kind, AllocKind};
use super::region::RegionHeader;
use super::runtime::{FinalizePhase, GcRuntime};
use super::zone::{Zone, ZoneGcState};

/// Bookkeeping passed through every finalize action ("fop").
pub struct FreeOp {
    pub on_background_thread: bool,
    pub cells_finalized: usize,
    pub bytes_freed: usize,
}

impl FreeOp {
    pub fn foreground() -> FreeOp {
        FreeOp {
            on_background_thread: false,
            cells_finalized: 0,
            bytes_freed: 0,
        }
    }

    pub fn background() -> FreeOp {
        FreeOp {
            on_background_thread: true,
            cells_finalized: 0,
            bytes_freed: 0,
        }
    }
}

pub type SweepFunc = fn(
    &mut GcRuntime,
    &mut FreeOp,
    *mut Zone,
    &mut SliceBudget,
    AllocKind,
) -> IncrementalProgress;

#[derive(Copy, Clone)]
pub struct SweepAction {
    pub func: SweepFunc,
    pub kind: AllocKind,
}

pub type SweepPhases = Vec<SmallVec<[SweepAction; 8]>>;

/// The sweep schedule. Foreground object kinds first (their finalizers may
/// inspect shapes), then the other foreground kinds, then one action that
/// queues every background-finalizable kind to the helper.
pub fn build_sweep_phases() -> SweepPhases {
    let mut phases: SweepPhases = Vec::new();

    let mut objects: SmallVec<[SweepAction; 8]> = SmallVec::new();
    for kind in AllocKind::ALL {
        if kind.is_object() && !is_background_finalizable(kind) {
            objects.push(SweepAction {
                func: finalize_alloc_kind,
                kind,
            });
        }
    }
    phases.push(objects);

    let mut rest: SmallVec<[SweepAction; 8]> = SmallVec::new();
    for kind in [
        AllocKind::Script,
        AllocKind::ExternalString,
        AllocKind::JitCode,
    ] {
        rest.push(SweepAction {
            func: finalize_alloc_kind,
            kind,
        });
    }
    phases.push(rest);

    let mut background: SmallVec<[SweepAction; 8]> = SmallVec::new();
    background.push(SweepAction {
        func: queue_background_finalization,
        kind: AllocKind::Object0,
    });
    phases.push(background);

    phases
}

/// Finalize the dead cells of one (zone, kind) on the active thread.
fn finalize_alloc_kind(
    rt: &mut GcRuntime,
    fop: &mut FreeOp,
    zone: *mut Zone,
    budget: &mut SliceBudget,
    kind: AllocKind,
) -> IncrementalProgress {
    unsafe {
        let mut region = (*zone).regions[kind.index()];
        while !region.is_null() {
            sweep_region(region, kind, fop);
            // Work accounting only; an action never suspends mid-kind.
            budget.step((*region).capacity() as i64);
            region = (*region).next;
        }
        (*zone).sub_gc_bytes(fop.bytes_freed);
        rt.stats.cells_finalized += fop.cells_finalized;
        fop.bytes_freed = 0;
        fop.cells_finalized = 0;
    }
    IncrementalProgress::Finished
}

/// Free every unmarked cell of one region and rebuild its free list
/// incrementally. Safe on the helper thread for background kinds.
pub(crate) unsafe fn sweep_region(region: *mut RegionHeader, kind: AllocKind, fop: &mut FreeOp) {
    let size = size_of_kind(kind);
    for cell in (*region).iter_cells() {
        if (*cell).is_permanent() || (*cell).is_marked_any() {
            continue;
        }
        finalize_cell(cell, kind);
        (*region).free_cell(cell);
        fop.cells_finalized += 1;
        fop.bytes_freed += size;
    }
}

/// Hand every background-finalizable kind of this zone to the helper.
fn queue_background_finalization(
    rt: &mut GcRuntime,
    _fop: &mut FreeOp,
    zone: *mut Zone,
    _budget: &mut SliceBudget,
    _kind: AllocKind,
) -> IncrementalProgress {
    unsafe {
        let mut regions = Vec::new();
        for kind in AllocKind::ALL {
            if !is_background_finalizable(kind) {
                continue;
            }
            let mut region = (*zone).regions[kind.index()];
            while !region.is_null() {
                regions.push(region as usize);
                region = (*region).next;
            }
        }
        if !regions.is_empty() {
            rt.background.queue(FinalizeJob {
                regions,
                zone: zone as usize,
            });
        }
    }
    IncrementalProgress::Finished
}

impl GcRuntime {
    /// Sweep tables that key on cells *before* any cell is finalized, while
    /// every header in every collecting zone is still intact: weak maps,
    /// cross-compartment wrapper maps, unique-id tables, the atom intern
    /// table.
    pub(crate) unsafe fn sweep_misc_all(&mut self) {
        let zones = self.collecting_zones();
        for &zone in &zones {
            for map in (*zone).weak_maps.iter_mut() {
                map.sweep();
            }
            for compartment in (*zone).compartments.iter_mut() {
                compartment.wrappers.retain(|&target, &mut wrapper| {
                    let target_cell = target as *mut CellHeader;
                    let wrapper_cell = wrapper as *mut CellHeader;
                    ((*target_cell).is_permanent() || (*target_cell).is_marked_any())
                        && (*wrapper_cell).is_marked_any()
                });
                compartment.incoming_gray.clear();
                if !compartment.initial_shape.is_null()
                    && !(*(compartment.initial_shape as *mut CellHeader)).is_marked_any()
                {
                    compartment.initial_shape = std::ptr::null_mut();
                }
                if !compartment.initial_group.is_null()
                    && !(*(compartment.initial_group as *mut CellHeader)).is_marked_any()
                {
                    compartment.initial_group = std::ptr::null_mut();
                }
            }
            (*zone).unique_ids.retain(|&cell, _| {
                let cell = cell as *mut CellHeader;
                (*cell).is_permanent() || (*cell).is_marked_any()
            });
        }
        self.sweep_atoms_table();
    }

    /// One step of the group × phase × zone × action iteration; returns
    /// `Finished` when the current group is done and the cursor has moved
    /// to the next one.
    unsafe fn sweep_group_step(&mut self, budget: &mut SliceBudget) -> IncrementalProgress {
        let group: Vec<*mut Zone> = self.sweep_groups[self.current_sweep_group].clone();

        if self.sweep_phase_index == 0 && self.sweep_zone_index == 0 && self.sweep_action_index == 0
        {
            for &zone in &group {
                (*zone).state = ZoneGcState::Sweep;
            }
            self.call_finalize_callbacks(FinalizePhase::GroupStart);
            for &zone in &group {
                self.call_weak_zone_callbacks(zone);
            }
        }

        while self.sweep_phase_index < self.sweep_phases.len() {
            let actions: SmallVec<[SweepAction; 8]> =
                self.sweep_phases[self.sweep_phase_index].clone();
            while self.sweep_zone_index < group.len() {
                let zone = group[self.sweep_zone_index];
                while self.sweep_action_index < actions.len() {
                    let action = actions[self.sweep_action_index];
                    let mut fop = FreeOp::foreground();
                    match (action.func)(self, &mut fop, zone, budget, action.kind) {
                        IncrementalProgress::NotFinished => return IncrementalProgress::NotFinished,
                        IncrementalProgress::Finished => self.sweep_action_index += 1,
                    }
                    // Suspension point: between actions.
                    if budget.is_over_budget()
                        && self.sweep_action_index < actions.len()
                    {
                        return IncrementalProgress::NotFinished;
                    }
                }
                self.sweep_action_index = 0;
                self.sweep_zone_index += 1;
                // Suspension point: between zones.
                if budget.is_over_budget() && self.sweep_zone_index < group.len() {
                    return IncrementalProgress::NotFinished;
                }
            }
            self.sweep_zone_index = 0;
            self.sweep_phase_index += 1;
        }

        for &zone in &group {
            (*zone).state = ZoneGcState::Finished;
        }
        self.call_finalize_callbacks(FinalizePhase::GroupEnd);
        self.sweep_phase_index = 0;
        self.current_sweep_group += 1;
        IncrementalProgress::Finished
    }

    pub(crate) unsafe fn perform_sweep_actions(
        &mut self,
        budget: &mut SliceBudget,
    ) -> IncrementalProgress {
        while self.current_sweep_group < self.sweep_groups.len() {
            if self.sweep_group_step(budget) == IncrementalProgress::NotFinished {
                return IncrementalProgress::NotFinished;
            }
            if budget.is_over_budget() && self.current_sweep_group < self.sweep_groups.len() {
                return IncrementalProgress::NotFinished;
            }
        }
        IncrementalProgress::Finished
    }

    /// Reset support: run the in-flight sweep group to its end, then
    /// abandon the remaining groups (their zones keep their marks; the next
    /// collection rebuilds everything).
    pub(crate) unsafe fn sweep_current_group_to_end(&mut self, budget: &mut SliceBudget) {
        if self.current_sweep_group >= self.sweep_groups.len() {
            return;
        }
        while self.sweep_group_step(budget) == IncrementalProgress::NotFinished {}
        for group in self.sweep_groups[self.current_sweep_group..].iter() {
            for &zone in group {
                (*zone).state = ZoneGcState::NoGc;
                (*zone).scheduled = false;
            }
        }
        self.current_sweep_group = self.sweep_groups.len();
    }

    /// Finalize-state work: wait out the helper, apply its accounting,
    /// release fully-empty regions.
    pub(crate) unsafe fn finish_sweeping(&mut self) {
        self.background.wait_idle();
        for result in self.background.take_results() {
            let zone = result.zone as *mut Zone;
            (*zone).sub_gc_bytes(result.bytes_freed);
            self.stats.cells_finalized += result.cells_finalized;
        }

        let zones = self.collecting_zones();
        let rt = self as *mut GcRuntime;
        for &zone in &zones {
            for kind in AllocKind::ALL {
                let mut empties = Vec::new();
                for region in (*zone).iter_regions(kind) {
                    if (*region).is_empty() {
                        empties.push(region);
                    }
                }
                for region in empties {
                    (*zone).remove_region(region);
                    (*rt).region_pool_mut().release_region(region);
                }
            }
        }
    }

    /// Prune interned atoms whose cells died this collection. Runs before
    /// any atom cell is finalized.
    unsafe fn sweep_atoms_table(&mut self) {
        let atoms_zone = self.atoms_zone_ptr();
        if atoms_zone.is_null() || !(*atoms_zone).is_collecting() {
            return;
        }
        let rt = self as *mut GcRuntime;
        self.with_exclusive_access(|| {
            (*rt).prune_atoms_table();
        });
    }
}

/// Regions handed to the helper. Addresses only, so the job is `Send`; the
/// regions stay linked in their zone and the mutator is kept away from them
/// until `wait_idle`.
pub struct FinalizeJob {
    pub regions: Vec<usize>,
    pub zone: usize,
}

pub struct SweepResult {
    pub zone: usize,
    pub bytes_freed: usize,
    pub cells_finalized: usize,
}

struct HelperState {
    queue: VecDeque<FinalizeJob>,
    results: Vec<SweepResult>,
    active: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<HelperState>,
    cv: Condvar,
}

/// The background finalization helper: one long-lived thread draining a job
/// queue, signalling completion through a condition variable.
pub struct BackgroundFinalizer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    enabled: bool,
}

unsafe fn run_job(job: &FinalizeJob) -> SweepResult {
    let mut fop = FreeOp::background();
    for &addr in &job.regions {
        let region = addr as *mut RegionHeader;
        sweep_region(region, (*region).kind(), &mut fop);
    }
    SweepResult {
        zone: job.zone,
        bytes_freed: fop.bytes_freed,
        cells_finalized: fop.cells_finalized,
    }
}

impl BackgroundFinalizer {
    pub fn new(enabled: bool) -> BackgroundFinalizer {
        let shared = Arc::new(Shared {
            state: Mutex::new(HelperState {
                queue: VecDeque::new(),
                results: Vec::new(),
                active: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let handle = if enabled {
            let shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("gc-finalizer".into())
                    .spawn(move || helper_main(shared))
                    .expect("failed to spawn the finalization helper"),
            )
        } else {
            None
        };
        BackgroundFinalizer {
            shared,
            handle,
            enabled,
        }
    }

    pub fn queue(&mut self, job: FinalizeJob) {
        if !self.enabled {
            // No helper: finalize synchronously, same accounting.
            let result = unsafe { run_job(&job) };
            self.lock_state(|state| state.results.push(result));
            return;
        }
        self.lock_state(|state| state.queue.push_back(job));
        self.shared.cv.notify_all();
    }

    /// Block until every queued job has run. The sweep-to-slice handshake:
    /// nothing may touch the swept regions before this returns.
    pub fn wait_idle(&self) {
        #[cfg(debug_assertions)]
        let _order = super::runtime::lock_order::acquire(super::runtime::lock_order::HELPER);
        let mut state = self.shared.state.lock();
        while state.active > 0 || !state.queue.is_empty() {
            self.shared.cv.wait(&mut state);
        }
    }

    pub fn take_results(&mut self) -> Vec<SweepResult> {
        self.lock_state(|state| std::mem::take(&mut state.results))
    }

    fn lock_state<R>(&self, f: impl FnOnce(&mut HelperState) -> R) -> R {
        #[cfg(debug_assertions)]
        let _order = super::runtime::lock_order::acquire(super::runtime::lock_order::HELPER);
        let mut state = self.shared.state.lock();
        f(&mut state)
    }

    pub fn shutdown(&mut self) {
        self.lock_state(|state| state.shutdown = true);
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn helper_main(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break job;
                }
                shared.cv.wait(&mut state);
            }
        };
        let result = unsafe { run_job(&job) };
        {
            let mut state = shared.state.lock();
            state.results.push(result);
            state.active -= 1;
        }
        shared.cv.notify_all();
    }
}

unsafe impl Send for FinalizeJob {}

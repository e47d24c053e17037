//! Allocation entry points and the allocator-state protocol.
//!
//! Every allocation runs `check_allocator_state` first: it is the
//! collector's safepoint. Zeal triggers fire here, store-buffer overflow is
//! honored here, incremental collections are nudged forward here, and
//! allocation in states that forbid it is refused here.
//!
//! The OOM contract: a failing tenured allocation runs the maybe-GC entry
//! (a last-ditch full collection), retries once, and only then reports
//! out-of-memory to the caller.

use thiserror::Error;

use super::cell::CellHeader;
use super::driver::{GcReason, SliceBudget, State};
use super::kinds::{is_nursery_allocable, AllocKind};
use super::region::RegionPool;
use super::runtime::{GcRuntime, HeapState};
use super::zone::Zone;
use crate::options::ZealMode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("allocation in a state that forbids it")]
    UnsafeRegion,
    #[error("operation on a thread outside the owning zone group")]
    WrongThread,
}

/// Caller's placement hint. `Tenured` forces the tenured path even for
/// nursery-allocable kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InitialHeap {
    Default,
    Tenured,
}

/// Work units granted to an allocation-triggered incremental slice.
const ALLOC_TRIGGER_SLICE_WORK: i64 = 4 * 1024;

impl GcRuntime {
    /// Allocate one cell of `kind` in `zone`. Nursery fast path for
    /// nursery-allocable kinds unless `heap` pins it tenured.
    pub(crate) unsafe fn allocate_cell(
        &mut self,
        zone: *mut Zone,
        kind: AllocKind,
        heap: InitialHeap,
    ) -> Result<*mut CellHeader, GcError> {
        self.check_allocator_state(zone, kind)?;

        if heap == InitialHeap::Default
            && self.params.generational
            && is_nursery_allocable(kind)
            && !(*zone).group.is_null()
        {
            let group = (*zone).group;
            let pool = self.region_pool_mut() as *mut RegionPool;
            let zone_index = (*zone).index_in_group;
            if let Some(cell) = (*group)
                .nursery
                .allocate(&mut *pool, group, kind, zone_index)
            {
                return Ok(cell);
            }
            // Nursery full: evict and retry once before giving up on the
            // fast path.
            let rt = self as *mut GcRuntime;
            super::nursery::minor_gc(rt, group, GcReason::OutOfNursery);
            if let Some(cell) = (*group)
                .nursery
                .allocate(&mut *pool, group, kind, zone_index)
            {
                return Ok(cell);
            }
        }

        match self.allocate_tenured(zone, kind) {
            Ok(cell) => Ok(cell),
            Err(_) => {
                // Last ditch: full collection, one retry, then OOM.
                self.gc(GcReason::LastDitch);
                self.allocate_tenured(zone, kind)
                    .map_err(|_| GcError::OutOfMemory)
            }
        }
    }

    /// Pre-allocation safepoint. May run minor GCs, slices, or whole
    /// collections; returns an error only for states that forbid
    /// allocation outright.
    pub(crate) unsafe fn check_allocator_state(
        &mut self,
        zone: *mut Zone,
        _kind: AllocKind,
    ) -> Result<(), GcError> {
        if self.in_unsafe_region() {
            return Err(GcError::UnsafeRegion);
        }
        if self.heap_state() != HeapState::Idle {
            // Inside a collection (e.g. a finalize callback): allocation is
            // forbidden, not deferred.
            return Err(GcError::UnsafeRegion);
        }
        if !(*zone).group.is_null() {
            (*(*zone).group).assert_entered();
        }

        if self.zeal_bits != 0 {
            self.run_zeal_triggers();
        }

        // Store-buffer overflow requests an immediate minor GC; this is the
        // earliest legal suspension point.
        if self.any_group_wants_minor_gc() {
            self.evict_nursery(GcReason::FullStoreBuffer);
        }

        // Sweeping and later states forbid handing out cells the sweep may
        // be looking at; finish the collection instead.
        if matches!(
            self.incremental_state,
            State::Sweep | State::Finalize | State::Compact | State::Decommit
        ) {
            self.finish_gc(GcReason::AllocTrigger);
        }

        if (*zone).over_trigger() {
            self.maybe_gc(zone);
        }
        Ok(())
    }

    unsafe fn run_zeal_triggers(&mut self) {
        if self.next_scheduled > 0 {
            self.next_scheduled -= 1;
        }
        if self.next_scheduled > 0 {
            return;
        }
        self.next_scheduled = self.zeal_frequency.max(1);
        if self.has_zeal(ZealMode::Alloc) {
            self.gc(GcReason::Zeal);
        } else if self.has_zeal(ZealMode::GenerationalGc) {
            self.evict_nursery(GcReason::Zeal);
        } else if self.has_zeal(ZealMode::IncrementalMultipleSlices) {
            if !self.is_incremental_gc_in_progress() {
                self.start_gc(GcReason::Zeal, SliceBudget::work(ALLOC_TRIGGER_SLICE_WORK));
            } else {
                self.gc_slice(GcReason::Zeal, SliceBudget::work(ALLOC_TRIGGER_SLICE_WORK));
            }
        }
    }

    /// The "maybe GC" entry: start or advance a collection when a zone is
    /// over its trigger. Called from the allocator and usable by the
    /// embedding at event-loop boundaries.
    pub fn maybe_gc(&mut self, zone: *mut Zone) {
        if self.in_unsafe_region() || self.heap_state() != HeapState::Idle {
            return;
        }
        unsafe {
            match self.incremental_state {
                State::NotActive => {
                    if (*zone).over_trigger() {
                        if self.params.incremental {
                            self.start_gc(
                                GcReason::MaybeGc,
                                SliceBudget::work(ALLOC_TRIGGER_SLICE_WORK),
                            );
                        } else {
                            self.gc(GcReason::MaybeGc);
                        }
                    }
                }
                State::MarkRoots | State::Mark => {
                    if (*zone).gc_bytes > (*zone).gc_trigger_bytes * 2 {
                        // Incremental too slow: the mutator is outrunning
                        // the slices, fall back to finishing now.
                        self.finish_gc(GcReason::AllocTrigger);
                    } else {
                        self.gc_slice(
                            GcReason::AllocTrigger,
                            SliceBudget::work(ALLOC_TRIGGER_SLICE_WORK),
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

//! The nursery and minor GC.
//!
//! The nursery is a bump-allocated run of regions owned by a zone group.
//! Minor GC is a copying collection: every nursery cell reachable from the
//! store buffer or the roots is copied into its zone's tenured space, a
//! forwarding overlay is written over the old header, and every visited slot
//! is rewritten to the copy. Afterwards the bump pointer resets, dead
//! malloc'd side buffers are freed, and oversized nurseries shrink back.
//!
//! Promotion publishes the tenured copy's header (kind included) *before*
//! installing the forwarding overlay, so a racing kind-reader sees either
//! the intact nursery cell or a fully initialized tenured one.

use std::collections::VecDeque;

use hashbrown::HashMap;

use super::cell::{CellColor, CellHeader, CELL_ALIGN};
use super::driver::GcReason;
use super::kinds::{size_of_kind, AllocKind};
use super::region::{
    in_nursery, RegionFlags, RegionHeader, RegionPool, FIRST_CELL_OFFSET, REGION_SIZE,
};
use super::runtime::GcRuntime;
use super::tracer::{trace_children, Tracer, TracerVariant};
use super::value::Value;
use super::zone::ZoneGroup;
use super::{round_up, Address};

/// Regions kept mapped after a minor GC; growth beyond this is given back.
const BASE_REGIONS: usize = 4;

/// A malloc'd slot buffer owned by a nursery object, keyed by address with
/// its capacity. Freed by the nursery sweep unless its owner is promoted
/// first.
struct NurseryBuffer {
    capacity: usize,
}

pub struct Nursery {
    regions: Vec<*mut RegionHeader>,
    current: usize,
    position: Address,
    limit: Address,
    enabled: bool,
    max_regions: usize,
    /// Buffer address → shape, for everything nursery cells malloc.
    malloced: HashMap<usize, NurseryBuffer>,
}

impl Nursery {
    pub fn new(capacity_bytes: usize) -> Nursery {
        let max_regions = (capacity_bytes / REGION_SIZE).max(1);
        Nursery {
            regions: Vec::new(),
            current: 0,
            position: Address::null(),
            limit: Address::null(),
            enabled: true,
            max_regions,
            malloced: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
            || (self.current == 0 && self.position == self.regions_start())
    }

    fn regions_start(&self) -> Address {
        if self.regions.is_empty() {
            Address::null()
        } else {
            Address::from_ptr(self.regions[0]).offset(FIRST_CELL_OFFSET)
        }
    }

    pub fn used_bytes(&self) -> usize {
        if self.regions.is_empty() {
            return 0;
        }
        self.current * (REGION_SIZE - FIRST_CELL_OFFSET)
            + self
                .position
                .offset_from(Address::from_ptr(self.regions[self.current]).offset(FIRST_CELL_OFFSET))
    }

    /// Bump-allocate a nursery cell. `None` means full (or disabled): take
    /// the tenured path or run a minor GC.
    pub unsafe fn allocate(
        &mut self,
        pool: &mut RegionPool,
        group: *mut ZoneGroup,
        kind: AllocKind,
        zone_index: u16,
    ) -> Option<*mut CellHeader> {
        if !self.enabled {
            return None;
        }
        let size = round_up(size_of_kind(kind), CELL_ALIGN);
        loop {
            if !self.position.is_null() && self.position.offset(size) <= self.limit {
                let cell = self.position.to_mut_ptr::<CellHeader>();
                self.position = self.position.offset(size);
                (*cell).init(kind, zone_index);
                return Some(cell);
            }
            if !self.advance_region(pool, group) {
                return None;
            }
        }
    }

    unsafe fn advance_region(&mut self, pool: &mut RegionPool, group: *mut ZoneGroup) -> bool {
        let next = if self.regions.is_empty() {
            0
        } else {
            self.current + 1
        };
        if next < self.regions.len() {
            self.current = next;
        } else {
            if self.regions.len() >= self.max_regions {
                return false;
            }
            let region = match pool.alloc_region(
                AllocKind::Object0,
                std::ptr::null_mut(),
                group,
                RegionFlags::NURSERY,
                0,
            ) {
                Ok(r) => r,
                Err(_) => return false,
            };
            self.regions.push(region);
            self.current = self.regions.len() - 1;
        }
        let base = Address::from_ptr(self.regions[self.current]);
        self.position = base.offset(FIRST_CELL_OFFSET);
        self.limit = base.offset(REGION_SIZE);
        true
    }

    pub(crate) fn register_values_buffer(&mut self, ptr: *mut Value, capacity: usize) {
        self.malloced
            .insert(ptr as usize, NurseryBuffer { capacity });
    }

    /// Ownership of the buffer moved to a promoted cell; the sweep must not
    /// free it.
    pub(crate) fn unregister_buffer(&mut self, ptr: *mut u8) {
        self.malloced.remove(&(ptr as usize));
    }

    /// Reset the bump pointer, free dead side buffers, shrink back to the
    /// base region count.
    pub unsafe fn sweep(&mut self, pool: &mut RegionPool) {
        for (ptr, buffer) in self.malloced.drain() {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                ptr as *mut Value,
                buffer.capacity,
            )));
        }
        while self.regions.len() > BASE_REGIONS {
            let region = self.regions.pop().unwrap();
            pool.release_region(region);
        }
        self.current = 0;
        if let Some(&first) = self.regions.first() {
            let base = Address::from_ptr(first);
            self.position = base.offset(FIRST_CELL_OFFSET);
            self.limit = base.offset(REGION_SIZE);
        } else {
            self.position = Address::null();
            self.limit = Address::null();
        }
    }
}

/// The copying visitor of minor GC. Rewrites every visited slot that points
/// at a nursery cell to point at its tenured copy.
pub struct TenuringTracer {
    runtime: *mut GcRuntime,
    group: *mut ZoneGroup,
    /// Tenured copies whose children still need visiting.
    fixup: VecDeque<*mut CellHeader>,
    pub tenured_cells: usize,
    pub tenured_bytes: usize,
}

impl TenuringTracer {
    pub unsafe fn new(runtime: *mut GcRuntime, group: *mut ZoneGroup) -> TenuringTracer {
        TenuringTracer {
            runtime,
            group,
            fixup: VecDeque::new(),
            tenured_cells: 0,
            tenured_bytes: 0,
        }
    }

    unsafe fn promote_or_forward(&mut self, cell: *mut CellHeader) -> *mut CellHeader {
        if let Some(target) = (*cell).forwarded_target() {
            return target.as_ptr();
        }
        let kind = (*cell).kind();
        let zone_index = (*cell).zone_index();
        let size = size_of_kind(kind);
        let zone = (*self.group).zone_ptr(zone_index);

        // Promotion cannot fail recoverably: there is no way to resume the
        // mutator with a half-moved nursery.
        let dst = (*self.runtime)
            .allocate_promoted_cell(zone, kind)
            .expect("out of memory while tenuring");

        std::ptr::copy_nonoverlapping(cell as *const u8, dst as *mut u8, size);
        // The copy carried the nursery header verbatim; publish a clean
        // tenured header before anyone can see the forwarding pointer.
        (*dst).init(kind, zone_index);
        if (*zone).is_marking() {
            // Keep the incremental snapshot: survivors promoted mid-mark
            // count as reached.
            (*dst).mark_if_unmarked(CellColor::Black);
        }
        (*cell).forward_to(dst);

        self.release_moved_buffers(dst, kind);
        self.tenured_cells += 1;
        self.tenured_bytes += size;
        self.fixup.push_back(dst);
        dst
    }

    /// The copy took ownership of any malloc'd side data; drop the
    /// nursery's claim on it. Only object kinds can both live in the
    /// nursery and own a buffer.
    unsafe fn release_moved_buffers(&mut self, cell: *mut CellHeader, kind: AllocKind) {
        if kind.is_object() {
            let obj = cell as *mut super::cells::JsObject;
            if !(*obj).dyn_slots.is_null() {
                (*self.group)
                    .nursery
                    .unregister_buffer((*obj).dyn_slots as *mut u8);
            }
        }
    }

    /// Drain the fixup queue, promoting transitively.
    pub unsafe fn trace_promoted(&mut self) {
        while let Some(cell) = self.fixup.pop_front() {
            let trc = self as *mut TenuringTracer;
            trace_children(cell, &mut *trc);
        }
    }
}

impl Tracer for TenuringTracer {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Tenuring
    }

    fn on_edge(
        &mut self,
        slot: *mut *mut CellHeader,
        _kind: super::kinds::TraceKind,
        _name: &'static str,
    ) {
        unsafe {
            let cell = *slot;
            if cell.is_null() || !in_nursery(cell) {
                return;
            }
            *slot = self.promote_or_forward(cell);
        }
    }

    fn on_value_edge(&mut self, slot: *mut Value, _name: &'static str) {
        unsafe {
            if let Some(cell) = (*slot).as_cell() {
                if !in_nursery(cell) {
                    return;
                }
                let moved = self.promote_or_forward(cell);
                *slot = Value::cell(moved);
            }
        }
    }
}

/// Run a minor GC over one zone group: store-buffer roots first, then the
/// runtime roots, then the transitive promotion queue; finish by resetting
/// the nursery. I5: nothing survives in the nursery afterwards.
pub unsafe fn minor_gc(rt: *mut GcRuntime, group: *mut ZoneGroup, reason: GcReason) {
    let nursery_used = (*group).nursery.used_bytes();
    if !(*group).nursery.is_enabled()
        || ((*group).nursery.is_empty() && (*group).store_buffer.is_empty())
    {
        (*group).store_buffer.clear();
        return;
    }

    log::debug!(
        "minor gc: reason {:?}, nursery {} bytes, store buffer {} entries",
        reason,
        nursery_used,
        (*group).store_buffer.len()
    );

    if (*rt).has_zeal(crate::options::ZealMode::CheckStoreBufferOnMinorGc) {
        super::verifier::verify_store_buffer(group);
    }

    let mut trc = TenuringTracer::new(rt, group);

    // 1. Remembered set.
    let buffer = &mut (*group).store_buffer as *mut super::store_buffer::StoreBuffer;
    (*buffer).trace_edges(&mut trc);

    // 2. Runtime roots.
    (*rt).trace_roots_for_minor_gc(&mut trc);

    // 3. Transitive closure of everything reached.
    trc.trace_promoted();

    // 4. Reset the nursery; the store buffer was discarded by the drain.
    let pool = (*rt).region_pool_mut();
    (*group).nursery.sweep(pool);

    if (*rt).has_zeal(crate::options::ZealMode::CheckNursery) {
        assert!(
            (*group).nursery.is_empty(),
            "nursery not empty after minor gc"
        );
        assert!((*group).store_buffer.is_empty());
    }

    (*rt).stats_mut().note_minor_gc(
        reason,
        nursery_used,
        trc.tenured_cells,
        trc.tenured_bytes,
    );
}

/// Chase a forwarded nursery cell during minor GC; used by callers outside
/// the tracer (e.g. weak map rekeying on eviction).
pub unsafe fn forwarded_or_self(cell: *mut CellHeader) -> *mut CellHeader {
    super::cell::maybe_forwarded(cell)
}

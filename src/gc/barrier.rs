//! Write and read barriers.
//!
//! The pre-barrier implements snapshot-at-the-beginning: between slices of
//! an incremental mark, overwriting a slot first marks the *old* referent
//! black, so every cell reachable when the slice started stays covered. The
//! post-barrier maintains the remembered set: a nursery pointer written into
//! a tenured slot lands in the owning group's store buffer. Read barriers
//! serve the cycle collector (gray→black exposure) and weak reads during
//! sweeping (resurrection).
//!
//! Barriers derive everything — zone, group, store buffer — from the cell
//! address via the region header, so the mutator does not thread a runtime
//! reference through every slot write.

use super::cell::{CellColor, CellHeader};
use super::marking::expose_gray_cell_to_black;
use super::region::{in_nursery, region_of};
use super::runtime::HeapState;
use super::value::Value;

/// Pre-barrier: called with a slot's *previous* value before it is
/// overwritten. Idempotent; marking an already-marked cell is a no-op.
pub unsafe fn pre_write_barrier(cell: *mut CellHeader) {
    if cell.is_null() || (*cell).is_permanent() {
        return;
    }
    let region = region_of(cell);
    if (*region).is_nursery() {
        // Nursery cells are not part of the incremental snapshot; minor GC
        // covers them through the store buffer and roots.
        return;
    }
    let zone = (*region).zone;
    if zone.is_null() || !(*zone).needs_pre_barrier() {
        return;
    }
    let rt = (*zone).runtime;
    if (*rt).heap_state() != HeapState::Idle {
        // The collector itself is running; its own traversal handles
        // reachability, barriers only cover mutator windows.
        return;
    }
    if !(*zone).group.is_null() {
        (*(*zone).group).assert_entered();
    }
    (*rt).marker.mark_black_from_barrier(cell);
}

pub unsafe fn pre_write_barrier_value(old: Value) {
    if let Some(cell) = old.as_cell() {
        pre_write_barrier(cell);
    }
}

/// Post-barrier: called after `next` was stored into `slot` of `owner`.
/// Remembers tenured→nursery edges.
pub unsafe fn post_write_barrier(
    owner: *mut CellHeader,
    slot: *mut *mut CellHeader,
    next: *mut CellHeader,
) {
    if next.is_null() || !in_nursery(next) {
        return;
    }
    if in_nursery(owner) {
        // Nursery→nursery needs no remembering; minor GC traces it.
        return;
    }
    let group = (*region_of(next)).group;
    (*group).assert_entered();
    (*group).store_buffer.put_cell_edge(slot);
}

pub unsafe fn post_write_barrier_value(owner: *mut CellHeader, slot: *mut Value, next: Value) {
    let Some(cell) = next.as_cell() else {
        return;
    };
    if !in_nursery(cell) || in_nursery(owner) {
        return;
    }
    let group = (*region_of(cell)).group;
    (*group).assert_entered();
    (*group).store_buffer.put_value_edge(slot);
}

/// Remember every nursery edge of `owner` at once. Used when a cell grows a
/// new slot buffer and its individual slot entries would go stale.
pub unsafe fn post_write_barrier_whole_cell(owner: *mut CellHeader) {
    if in_nursery(owner) {
        return;
    }
    let region = region_of(owner);
    if (*region).group.is_null() {
        return;
    }
    (*(*region).group).store_buffer.put_whole_cell(owner);
}

/// Read barrier for mutator reads that may observe gray cells (cycle
/// collector discipline) or cells in a sweeping zone (weak resurrection).
pub unsafe fn read_barrier(cell: *mut CellHeader) {
    if cell.is_null() || (*cell).is_permanent() {
        return;
    }
    if (*cell).is_marked_gray() {
        expose_gray_cell_to_black(cell);
    }
    let region = region_of(cell);
    if (*region).is_nursery() {
        return;
    }
    let zone = (*region).zone;
    if !zone.is_null() && (*zone).is_sweeping() {
        // Resurrect: the cell is being handed back to the mutator while its
        // zone sweeps, so it must not be finalized.
        (*cell).mark_if_unmarked(CellColor::Black);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cells::JsObject;
    use crate::gc::runtime::{GcRuntime, InitialHeap};
    use crate::gc::value::Value;
    use crate::gc::zone::ZoneSpec;
    use crate::GcParams;

    #[test]
    fn post_barrier_remembers_tenured_to_nursery_edges() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let holder = rt
            .allocate_object(compartment, 2, true, InitialHeap::Tenured)
            .unwrap();
        let young = rt
            .allocate_object(compartment, 0, true, InitialHeap::Default)
            .unwrap();

        JsObject::set_slot(holder, 0, Value::cell(young.as_cell()));

        unsafe {
            let group = (*region_of(holder.as_cell())).group;
            assert!(
                (*group).store_buffer.contains_value_edge(holder.slot_ptr(0)),
                "the written slot must be in the remembered set"
            );
            // A tenured value in the other slot leaves no entry.
            let old = rt
                .allocate_object(compartment, 0, true, InitialHeap::Tenured)
                .unwrap();
            JsObject::set_slot(holder, 1, Value::cell(old.as_cell()));
            assert!(!(*group).store_buffer.contains_value_edge(holder.slot_ptr(1)));
        }
    }

    #[test]
    fn nursery_to_nursery_edges_are_not_remembered() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let a = rt
            .allocate_object(compartment, 1, true, InitialHeap::Default)
            .unwrap();
        let b = rt
            .allocate_object(compartment, 0, true, InitialHeap::Default)
            .unwrap();
        JsObject::set_slot(a, 0, Value::cell(b.as_cell()));
        unsafe {
            let group = (*region_of(b.as_cell())).group;
            assert!(!(*group).store_buffer.contains_value_edge(a.slot_ptr(0)));
        }
    }

    #[test]
    fn pre_barrier_is_inert_outside_marking() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let holder = rt
            .allocate_object(compartment, 1, true, InitialHeap::Tenured)
            .unwrap();
        let old = rt
            .allocate_object(compartment, 0, true, InitialHeap::Tenured)
            .unwrap();
        JsObject::set_slot(holder, 0, Value::cell(old.as_cell()));
        // Overwrite with no collection in progress: nothing gets marked.
        JsObject::set_slot(holder, 0, Value::int32(0));
        assert!(!old.header().is_marked_any());
    }
}

//! Compaction: relocate cells out of fragmented regions and forward every
//! reference to them.
//!
//! Relocation picks the emptiest regions of each compactable kind, but only
//! as long as the survivors fit in the free space of the regions that stay;
//! moving cells into freshly mapped regions would defeat the point. Each
//! moved cell leaves a forwarding overlay in its old header.
//!
//! The pointer update that follows is heap-wide and runs in three passes —
//! shapes first, then object groups (typed-object descriptors), then
//! everything else — because the later passes read structures the earlier
//! ones fix up. Roots, weak maps, wrapper maps and unique-id tables are
//! rewritten in the same sweep. Forwarding state dies with the source
//! regions at the end of the phase.

use super::cell::{maybe_forwarded, CellHeader};
use super::driver::{GcReason, IncrementalProgress, SliceBudget};
use super::kinds::{is_compactable, size_of_kind, AllocKind, TraceKind};
use super::region::RegionHeader;
use super::runtime::GcRuntime;
use super::tracer::{trace_children, Tracer, TracerVariant};
use super::value::Value;
use super::zone::{Zone, ZoneGcState};

/// Rewrites edges through forwarding overlays.
pub struct MovingTracer;

impl Tracer for MovingTracer {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Moving
    }

    fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
        unsafe {
            let cell = *slot;
            if let Some(target) = (*cell).forwarded_target() {
                *slot = target.as_ptr();
            }
        }
    }

    fn on_value_edge(&mut self, slot: *mut Value, _name: &'static str) {
        unsafe {
            if let Some(cell) = (*slot).as_cell() {
                if let Some(target) = (*cell).forwarded_target() {
                    *slot = Value::cell(target.as_ptr());
                }
            }
        }
    }
}

const UPDATE_PHASES: [&[TraceKind]; 3] = [
    &[TraceKind::Shape, TraceKind::AccessorShape, TraceKind::BaseShape],
    &[TraceKind::ObjectGroup],
    &[
        TraceKind::Object,
        TraceKind::Script,
        TraceKind::LazyScript,
        TraceKind::String,
        TraceKind::ExternalString,
        TraceKind::Atom,
        TraceKind::Symbol,
        TraceKind::JitCode,
        TraceKind::Scope,
        TraceKind::RegExpShared,
    ],
];

impl GcRuntime {
    pub(crate) unsafe fn compact_phase(&mut self, budget: &mut SliceBudget) -> IncrementalProgress {
        // Work on an empty nursery so no young cell or store-buffer slot
        // references a cell this phase moves. Every slice: the mutator may
        // have refilled the nursery since the last one, and the pointer
        // update below only walks tenured cells.
        self.evict_nursery(GcReason::EvictNursery);

        let mut zones: Vec<*mut Zone> = Vec::new();
        self.for_each_zone(|zone| {
            if (*zone).is_collecting() && !(*zone).is_atoms_zone {
                zones.push(zone);
            }
        });

        while self.compact_zone_cursor < zones.len() {
            let zone = zones[self.compact_zone_cursor];
            (*zone).state = ZoneGcState::Compact;
            self.relocate_zone_cells(zone);
            (*zone).state = ZoneGcState::Finished;
            self.compact_zone_cursor += 1;
            if budget.is_over_budget() && self.compact_zone_cursor < zones.len() {
                return IncrementalProgress::NotFinished;
            }
        }

        if !self.relocated_cells.is_empty() {
            self.update_all_pointers();
        }
        self.release_relocated_regions();
        IncrementalProgress::Finished
    }

    /// Pick relocation sources for every compactable kind of `zone` and
    /// move their live cells into the remaining regions' free space.
    unsafe fn relocate_zone_cells(&mut self, zone: *mut Zone) {
        for kind in AllocKind::ALL {
            if !is_compactable(kind) {
                continue;
            }
            let regions: Vec<*mut RegionHeader> = (*zone).iter_regions(kind).collect();
            if regions.len() < 2 {
                continue;
            }

            let mut candidates: Vec<*mut RegionHeader> = regions
                .iter()
                .copied()
                .filter(|&r| (*r).is_fragmented())
                .collect();
            candidates.sort_by_key(|&r| (*r).live_count);

            // Emptiest first, while the survivors fit in the free space of
            // whatever stays behind (a selected region's own free space
            // stops counting).
            let mut free_elsewhere: usize = regions
                .iter()
                .map(|&r| (*r).capacity() - (*r).live_count as usize)
                .sum();

            let mut selected = Vec::new();
            for region in candidates {
                let live = (*region).live_count as usize;
                let own_free = (*region).capacity() - live;
                if free_elsewhere >= own_free && live <= free_elsewhere - own_free {
                    free_elsewhere -= own_free + live;
                    selected.push(region);
                }
            }

            for &region in &selected {
                (*zone).remove_region(region);
                (*region).flags.insert(super::region::RegionFlags::RELOCATING);
            }

            let mut failed = false;
            for &region in &selected {
                if failed {
                    // Out of memory mid-phase: leave the rest in place.
                    self.relink_region(zone, region);
                    continue;
                }
                for cell in (*region).iter_cells() {
                    match self.allocate_tenured(zone, kind) {
                        Ok(dst) => {
                            std::ptr::copy_nonoverlapping(
                                cell as *const u8,
                                dst as *mut u8,
                                size_of_kind(kind),
                            );
                            (*cell).forward_to(dst);
                            self.relocated_cells.push((region as usize, cell as usize));
                        }
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    self.relink_region(zone, region);
                } else {
                    self.relocated_src_regions.push(region as usize);
                    self.stats.regions_relocated += 1;
                }
            }
        }
    }

    unsafe fn relink_region(&mut self, zone: *mut Zone, region: *mut RegionHeader) {
        (*region)
            .flags
            .remove(super::region::RegionFlags::RELOCATING);
        (*zone).push_region(region);
        // Cells already moved out of it are freed with the rest once the
        // pointer update is done.
        self.relocated_src_regions.push(region as usize);
    }

    /// Rewrite every edge in the heap, plus every runtime-side table, to
    /// point at relocated cells' new addresses.
    unsafe fn update_all_pointers(&mut self) {
        let rt = self as *mut GcRuntime;
        let mut moving = MovingTracer;

        for phase_kinds in UPDATE_PHASES {
            (*rt).for_each_zone(|zone| {
                for kind in AllocKind::ALL {
                    if !phase_kinds.contains(&super::kinds::trace_kind_of(kind)) {
                        continue;
                    }
                    for region in (*zone).iter_regions(kind) {
                        for cell in (*region).iter_cells() {
                            trace_children(cell, &mut moving);
                        }
                    }
                }
            });
        }

        // Roots: stack, persistent, embedder.
        (*rt).trace_black_roots(&mut moving);
        (*rt).trace_gray_roots(&mut moving);

        // Runtime-side tables keyed on addresses.
        (*rt).for_each_zone(|zone| {
            for map in (*zone).weak_maps.iter_mut() {
                map.update_after_compaction();
            }
            let ids = std::mem::take(&mut (*zone).unique_ids);
            for (cell, id) in ids {
                let cell = maybe_forwarded(cell as *mut CellHeader);
                (*zone).unique_ids.insert(cell as usize, id);
            }
            for compartment in (*zone).compartments.iter_mut() {
                let wrappers = std::mem::take(&mut compartment.wrappers);
                for (target, wrapper) in wrappers {
                    let target = maybe_forwarded(target as *mut CellHeader);
                    let wrapper =
                        maybe_forwarded(wrapper as *mut CellHeader) as *mut super::cells::JsObject;
                    compartment.wrappers.insert(target as usize, wrapper);
                }
                if !compartment.initial_shape.is_null() {
                    compartment.initial_shape = maybe_forwarded(
                        compartment.initial_shape as *mut CellHeader,
                    ) as *mut super::cells::Shape;
                }
                if !compartment.initial_group.is_null() {
                    compartment.initial_group = maybe_forwarded(
                        compartment.initial_group as *mut CellHeader,
                    ) as *mut super::cells::ObjectGroup;
                }
            }
        });
    }

    /// Free the old copies and hand fully-emptied source regions back to
    /// the pool. This discards the forwarding overlays (I6).
    unsafe fn release_relocated_regions(&mut self) {
        let cells = std::mem::take(&mut self.relocated_cells);
        for (region, cell) in cells {
            let region = region as *mut RegionHeader;
            let cell = cell as *mut CellHeader;
            (*region).free_cell(cell);
            let zone = (*region).zone;
            if !zone.is_null() {
                (*zone).sub_gc_bytes(size_of_kind((*region).kind()));
            }
        }
        let regions = std::mem::take(&mut self.relocated_src_regions);
        let rt = self as *mut GcRuntime;
        for region in regions {
            let region = region as *mut RegionHeader;
            if (*region)
                .flags
                .contains(super::region::RegionFlags::RELOCATING)
            {
                debug_assert!((*region).is_empty());
                (*region)
                    .flags
                    .remove(super::region::RegionFlags::RELOCATING);
                (*rt).region_pool_mut().release_region(region);
            }
        }
    }
}

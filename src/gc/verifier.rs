//! Heap verification modes.
//!
//! Three checkers, all zeal-gated:
//! - the pre-barrier verifier snapshots the reachable set when an
//!   incremental collection starts and asserts at the end of marking that
//!   every snapshot cell got marked (snapshot-at-the-beginning, P1);
//! - the store-buffer verifier walks the tenured heap before a minor GC and
//!   asserts every tenured slot holding a nursery pointer is remembered
//!   (P7);
//! - the whole-heap checker validates the black→gray invariant (I2) after a
//!   collection, healing violations in release builds.

use hashbrown::HashSet;

use super::cell::CellHeader;
use super::kinds::{AllocKind, TraceKind};
use super::marking::expose_gray_cell_to_black;
use super::region::{in_nursery, zone_of};
use super::runtime::GcRuntime;
use super::store_buffer::StoreBuffer;
use super::tracer::{trace_children, Tracer, TracerVariant};
use super::value::Value;
use super::zone::ZoneGroup;

struct ReachabilityCollector<'a> {
    seen: &'a mut HashSet<usize>,
    queue: &'a mut Vec<*mut CellHeader>,
}

impl<'a> Tracer for ReachabilityCollector<'a> {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Callback
    }

    fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
        unsafe {
            let cell = *slot;
            if cell.is_null() || (*cell).is_permanent() {
                return;
            }
            if self.seen.insert(cell as usize) {
                self.queue.push(cell);
            }
        }
    }
}

/// Record every cell reachable from the roots right now. Runs after the
/// nursery eviction that precedes the mark phase, so the snapshot is all
/// tenured.
pub unsafe fn start_pre_barrier_verifier(rt: &mut GcRuntime) {
    let mut seen = HashSet::new();
    let mut queue = Vec::new();
    {
        let mut collector = ReachabilityCollector {
            seen: &mut seen,
            queue: &mut queue,
        };
        let rt_ptr = rt as *mut GcRuntime;
        (*rt_ptr).trace_black_roots(&mut collector);
        (*rt_ptr).trace_gray_roots(&mut collector);
    }
    while let Some(cell) = queue.pop() {
        let mut collector = ReachabilityCollector {
            seen: &mut seen,
            queue: &mut queue,
        };
        trace_children(cell, &mut collector);
    }
    log::debug!("pre-barrier verifier armed: {} cells", seen.len());
    rt.verify_snapshot = Some(seen);
}

/// P1: everything reachable at slice 0 must be marked once marking is done,
/// whatever the mutator did in between.
pub unsafe fn end_pre_barrier_verifier(rt: &mut GcRuntime) {
    let Some(snapshot) = rt.verify_snapshot.take() else {
        return;
    };
    for &cell in &snapshot {
        let cell = cell as *mut CellHeader;
        let zone = zone_of(cell);
        if zone.is_null() || !(*zone).is_collecting() {
            continue;
        }
        assert!(
            (*cell).is_marked_any(),
            "pre-barrier verifier: snapshot cell {:p} not marked at end of mark",
            cell
        );
    }
}

struct CoverageChecker<'a> {
    buffer: &'a StoreBuffer,
    owner: *mut CellHeader,
    missing: usize,
}

impl<'a> Tracer for CoverageChecker<'a> {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Callback
    }

    fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
        unsafe {
            let target = *slot;
            if target.is_null() || !in_nursery(target) {
                return;
            }
            if !self.buffer.contains_cell_edge(slot)
                && !self.buffer.contains_whole_cell(self.owner)
            {
                self.missing += 1;
            }
        }
    }

    fn on_value_edge(&mut self, slot: *mut Value, _name: &'static str) {
        unsafe {
            let Some(target) = (*slot).as_cell() else {
                return;
            };
            if !in_nursery(target) {
                return;
            }
            if !self.buffer.contains_value_edge(slot)
                && !self.buffer.contains_whole_cell(self.owner)
            {
                self.missing += 1;
            }
        }
    }
}

/// P7: walk the group's tenured heap and check that every slot holding a
/// nursery pointer appears in the store buffer.
pub unsafe fn verify_store_buffer(group: *mut ZoneGroup) {
    let mut missing = 0;
    for zone_index in 0..(*group).zones.len() {
        let zone = (*group).zone_ptr(zone_index as u16);
        for kind in AllocKind::ALL {
            for region in (*zone).iter_regions(kind) {
                for cell in (*region).iter_cells() {
                    let mut checker = CoverageChecker {
                        buffer: &(*group).store_buffer,
                        owner: cell,
                        missing: 0,
                    };
                    trace_children(cell, &mut checker);
                    missing += checker.missing;
                }
            }
        }
    }
    assert_eq!(
        missing, 0,
        "store buffer verifier: {} tenured slots hold unremembered nursery pointers",
        missing
    );
}

/// I2 and forwarding hygiene, checked over the whole heap after a
/// collection. Violations are fatal in debug builds and healed by the gray
/// unmark recursion in release builds.
pub unsafe fn check_heap(rt: &mut GcRuntime) {
    struct InvariantChecker {
        owner_black: bool,
        owner_group: *mut ZoneGroup,
        gray_targets: Vec<*mut CellHeader>,
    }

    impl Tracer for InvariantChecker {
        fn variant(&self) -> TracerVariant {
            TracerVariant::Callback
        }

        fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
            unsafe {
                let target = *slot;
                assert!(
                    !(*target).is_forwarded(),
                    "dangling forwarded pointer after collection"
                );
                if self.owner_black && (*target).is_marked_gray() {
                    let target_group = (*super::region::region_of(target)).group;
                    if target_group == self.owner_group {
                        self.gray_targets.push(target);
                    }
                }
            }
        }
    }

    let mut violations = Vec::new();
    let rt_ptr = rt as *mut GcRuntime;
    (*rt_ptr).for_each_zone(|zone| {
        for kind in AllocKind::ALL {
            for region in (*zone).iter_regions(kind) {
                for cell in (*region).iter_cells() {
                    let mut checker = InvariantChecker {
                        owner_black: (*cell).is_marked_black(),
                        owner_group: (*region).group,
                        gray_targets: Vec::new(),
                    };
                    trace_children(cell, &mut checker);
                    violations.extend(checker.gray_targets);
                }
            }
        }
    });

    if violations.is_empty() {
        return;
    }
    if cfg!(debug_assertions) {
        panic!(
            "heap check: {} black→gray edges within a collecting group",
            violations.len()
        );
    }
    // Release builds heal: promote the gray side to black.
    for cell in violations {
        expose_gray_cell_to_black(cell);
    }
}

//! Zones, compartments, zone groups.
//!
//! A zone is the unit the collector schedules: it owns the tenured regions
//! of its cells, the tables that must be swept with them, and the bitmap of
//! atoms it references. A compartment is an isolation scope inside a zone;
//! edges that cross compartments go through wrapper objects and are the raw
//! material for sweep-group scheduling. A zone group is an exclusive-access
//! domain: one nursery, one store buffer, at most one cooperating thread
//! inside at a time (reentry is counted).

use std::thread::ThreadId;

use hashbrown::HashMap;

use super::atom_marking::DenseBitmap;
use super::cell::CellHeader;
use super::cells::JsObject;
use super::kinds::{AllocKind, ALLOC_KIND_COUNT};
use super::nursery::Nursery;
use super::region::RegionHeader;
use super::runtime::GcRuntime;
use super::store_buffer::StoreBuffer;
use super::weak_map::WeakMap;

/// Where a new compartment should live.
pub enum ZoneSpec {
    /// Attach to the runtime's system zone.
    System,
    /// Attach to an existing zone.
    Existing(*mut Zone),
    /// Fresh zone in a fresh zone group.
    NewZoneInNewGroup,
    /// Fresh zone in the system zone's group.
    NewZoneInSystemGroup,
    /// Fresh zone in the given group.
    NewZoneInExistingGroup(*mut ZoneGroup),
}

/// Per-zone collection state, advanced by the incremental driver.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ZoneGcState {
    NoGc,
    MarkBlack,
    MarkGray,
    Sweep,
    Finished,
    Compact,
}

pub struct Zone {
    pub(crate) runtime: *mut GcRuntime,
    pub(crate) group: *mut ZoneGroup,
    /// Index of this zone in its group; nursery cells carry it in their
    /// header so promotion knows where to copy.
    pub(crate) index_in_group: u16,
    pub(crate) is_atoms_zone: bool,

    pub(crate) state: ZoneGcState,
    /// Scheduled for the in-progress (or next) collection.
    pub(crate) scheduled: bool,
    /// Queued for teardown; reaching this mid-incremental forces a reset.
    pub(crate) destroy_scheduled: bool,

    /// Head of the region list, one list per kind.
    pub(crate) regions: [*mut RegionHeader; ALLOC_KIND_COUNT],
    /// Region the allocator is currently filling, per kind.
    pub(crate) alloc_cursor: [*mut RegionHeader; ALLOC_KIND_COUNT],

    pub(crate) compartments: Vec<Box<Compartment>>,

    /// Which atoms this zone references (I7: an atom stays alive iff some
    /// live zone's bitmap names it).
    pub(crate) atom_bitmap: DenseBitmap,

    /// Stable ids handed out for cells of this zone; rekeyed before sweep
    /// when cells move.
    pub(crate) unique_ids: HashMap<usize, u64>,

    pub(crate) weak_maps: Vec<Box<WeakMap>>,

    /// Link threading the zones of one sweep group.
    pub(crate) next_in_sweep_group: *mut Zone,

    pub(crate) gc_bytes: usize,
    pub(crate) gc_trigger_bytes: usize,
    pub(crate) malloc_bytes: usize,
    pub(crate) malloc_trigger_bytes: usize,
}

impl Zone {
    pub(crate) fn new(
        runtime: *mut GcRuntime,
        group: *mut ZoneGroup,
        index_in_group: u16,
        is_atoms_zone: bool,
    ) -> Box<Zone> {
        Box::new(Zone {
            runtime,
            group,
            index_in_group,
            is_atoms_zone,
            state: ZoneGcState::NoGc,
            scheduled: false,
            destroy_scheduled: false,
            regions: [std::ptr::null_mut(); ALLOC_KIND_COUNT],
            alloc_cursor: [std::ptr::null_mut(); ALLOC_KIND_COUNT],
            compartments: Vec::new(),
            atom_bitmap: DenseBitmap::new(),
            unique_ids: HashMap::new(),
            weak_maps: Vec::new(),
            next_in_sweep_group: std::ptr::null_mut(),
            gc_bytes: 0,
            gc_trigger_bytes: 1024 * 1024,
            malloc_bytes: 0,
            malloc_trigger_bytes: 8 * 1024 * 1024,
        })
    }

    #[inline(always)]
    pub fn is_collecting(&self) -> bool {
        self.state != ZoneGcState::NoGc
    }

    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        matches!(self.state, ZoneGcState::MarkBlack | ZoneGcState::MarkGray)
    }

    #[inline(always)]
    pub fn is_sweeping(&self) -> bool {
        self.state == ZoneGcState::Sweep
    }

    /// Should mutator slot writes pre-barrier old values for this zone?
    #[inline(always)]
    pub fn needs_pre_barrier(&self) -> bool {
        self.is_marking()
    }

    pub(crate) fn add_gc_bytes(&mut self, bytes: usize) {
        self.gc_bytes += bytes;
    }

    pub(crate) fn sub_gc_bytes(&mut self, bytes: usize) {
        debug_assert!(self.gc_bytes >= bytes);
        self.gc_bytes -= bytes;
    }

    pub(crate) fn update_malloc_bytes(&mut self, bytes: usize) {
        self.malloc_bytes += bytes;
    }

    pub fn over_trigger(&self) -> bool {
        self.gc_bytes > self.gc_trigger_bytes || self.malloc_bytes > self.malloc_trigger_bytes
    }

    /// Re-derive the trigger from retained size after a collection.
    pub(crate) fn update_trigger_after_gc(&mut self) {
        self.gc_trigger_bytes = ((self.gc_bytes as f64 * 1.5) as usize).max(1024 * 1024);
        self.malloc_bytes = 0;
    }

    pub fn iter_regions(&self, kind: AllocKind) -> ZoneRegionIter {
        ZoneRegionIter {
            next: self.regions[kind.index()],
        }
    }

    pub(crate) unsafe fn push_region(&mut self, region: *mut RegionHeader) {
        let kind = (*region).kind().index();
        (*region).next = self.regions[kind];
        self.regions[kind] = region;
    }

    /// Unlink `region` from its kind's list. Used when compaction retires a
    /// relocation source.
    pub(crate) unsafe fn remove_region(&mut self, region: *mut RegionHeader) {
        let kind = (*region).kind().index();
        let mut link = &mut self.regions[kind];
        while !(*link).is_null() {
            if *link == region {
                *link = (*region).next;
                (*region).next = std::ptr::null_mut();
                if self.alloc_cursor[kind] == region {
                    self.alloc_cursor[kind] = std::ptr::null_mut();
                }
                return;
            }
            link = &mut (**link).next;
        }
        debug_assert!(false, "region not in zone list");
    }

    /// Total live cells of one kind; test and verifier support.
    pub fn live_cells(&self, kind: AllocKind) -> usize {
        self.iter_regions(kind)
            .map(|r| unsafe { (*r).live_count as usize })
            .sum()
    }

    pub fn region_count(&self, kind: AllocKind) -> usize {
        self.iter_regions(kind).count()
    }
}

pub struct ZoneRegionIter {
    next: *mut RegionHeader,
}

impl Iterator for ZoneRegionIter {
    type Item = *mut RegionHeader;

    fn next(&mut self) -> Option<*mut RegionHeader> {
        if self.next.is_null() {
            return None;
        }
        let region = self.next;
        self.next = unsafe { (*region).next };
        Some(region)
    }
}

pub struct Compartment {
    pub(crate) zone: *mut Zone,
    /// Cross-compartment wrapper map: target cell → wrapper object living in
    /// this compartment.
    pub(crate) wrappers: HashMap<usize, *mut JsObject>,
    /// Wrappers in *other* compartments pointing at gray cells here. Filled
    /// by gray marking, drained after the slice.
    pub(crate) incoming_gray: Vec<*mut JsObject>,
    /// Primordial group and shape for plain objects; created on first use.
    pub(crate) initial_group: *mut crate::gc::cells::ObjectGroup,
    pub(crate) initial_shape: *mut crate::gc::cells::Shape,
}

impl Compartment {
    pub(crate) fn new(zone: *mut Zone) -> Box<Compartment> {
        Box::new(Compartment {
            zone,
            wrappers: HashMap::new(),
            incoming_gray: Vec::new(),
            initial_group: std::ptr::null_mut(),
            initial_shape: std::ptr::null_mut(),
        })
    }

    pub fn zone(&self) -> *mut Zone {
        self.zone
    }

    pub(crate) fn lookup_wrapper(&self, target: *mut CellHeader) -> Option<*mut JsObject> {
        self.wrappers.get(&(target as usize)).copied()
    }
}

pub struct ZoneGroup {
    pub(crate) runtime: *mut GcRuntime,
    pub(crate) zones: Vec<Box<Zone>>,
    pub(crate) nursery: Nursery,
    pub(crate) store_buffer: StoreBuffer,
    /// Cooperating thread currently inside the group, with reentry count.
    pub(crate) owner: Option<ThreadId>,
    pub(crate) enter_count: usize,
}

impl ZoneGroup {
    pub(crate) fn new(runtime: *mut GcRuntime, nursery_bytes: usize) -> Box<ZoneGroup> {
        Box::new(ZoneGroup {
            runtime,
            zones: Vec::new(),
            nursery: Nursery::new(nursery_bytes),
            store_buffer: StoreBuffer::new(),
            owner: None,
            enter_count: 0,
        })
    }

    /// Enter the group on the current thread. Panics if another thread is
    /// inside: groups are exclusive-access domains.
    pub fn enter(&mut self) {
        let me = std::thread::current().id();
        match self.owner {
            Some(owner) if owner != me => {
                panic!("zone group entered while owned by another thread")
            }
            _ => {
                self.owner = Some(me);
                self.enter_count += 1;
            }
        }
    }

    pub fn leave(&mut self) {
        debug_assert!(self.enter_count > 0);
        self.enter_count -= 1;
        if self.enter_count == 0 {
            self.owner = None;
        }
    }

    /// The barrier protocol is a correctness requirement: invoking a barrier
    /// from a thread that is not inside the owning group is fatal.
    pub fn assert_entered(&self) {
        if let Some(owner) = self.owner {
            if owner == std::thread::current().id() {
                return;
            }
        }
        panic!("barrier invoked on a thread outside the owning zone group");
    }

    pub(crate) fn zone_ptr(&mut self, index: u16) -> *mut Zone {
        &mut *self.zones[index as usize] as *mut Zone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_reentry_is_counted() {
        let mut group = ZoneGroup::new(std::ptr::null_mut(), 64 * 1024);
        group.enter();
        group.enter();
        group.assert_entered();
        group.leave();
        // Still inside after one leave.
        group.assert_entered();
        group.leave();
        assert!(group.owner.is_none());
    }

    #[test]
    #[should_panic(expected = "outside the owning zone group")]
    fn barrier_outside_group_is_fatal() {
        let group = ZoneGroup::new(std::ptr::null_mut(), 64 * 1024);
        group.assert_entered();
    }

    #[test]
    fn zone_trigger_grows_with_retained_size() {
        let mut zone = Zone::new(std::ptr::null_mut(), std::ptr::null_mut(), 0, false);
        zone.add_gc_bytes(4 * 1024 * 1024);
        assert!(zone.over_trigger());
        zone.update_trigger_after_gc();
        assert!(!zone.over_trigger());
        assert_eq!(zone.gc_trigger_bytes, 6 * 1024 * 1024);
    }
}

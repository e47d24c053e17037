//! The collector runtime: owner of every zone group, the atoms zone, the
//! marker, the root lists, the helper thread, and the incremental driver's
//! state. This is the only type the embedding talks to.
//!
//! `GcRuntime` is handed out boxed and must never move: zones, regions and
//! the marker keep raw pointers back into it.

use std::ptr::null_mut;

use hashbrown::{HashMap, HashSet};

use super::atom_marking::{atom_index, AtomMarkingRuntime};
use super::cell::{CellColor, CellHeader, Gc};
use super::cells::{
    finalize_cell, JsObject, JsString, ObjectGroup, Scope, Script, Shape, Symbol,
    INLINE_STRING_CAPACITY, OBJ_FLAG_WRAPPER,
};
use super::driver::{AbortReason, GcReason, State};
use super::kinds::{object_kind_for_slots, size_of_kind, AllocKind, TraceKind};
use super::marking::GcMarker;
use super::nursery::minor_gc;
use super::region::{in_nursery, RegionFlags, RegionPool, REGION_PAYLOAD};
use super::roots::{PersistentRooted, RootLists, TraceOp};
use super::shadowstack::ShadowStack;
use super::statistics::{GcStats, Statistics};
use super::sweep::{build_sweep_phases, BackgroundFinalizer, SweepPhases};
use super::tracer::Tracer;
use super::value::Value;
use super::weak_map::{WeakMap, WeakMapRef};
use super::zone::{Compartment, Zone, ZoneGroup, ZoneSpec};
use crate::options::{GcParams, ZealMode};

pub use super::allocator::{GcError, InitialHeap};

/// What the heap is busy with. Root iteration and barriers consult this.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapState {
    Idle,
    Tracing,
    MajorCollecting,
    MinorCollecting,
}

/// Finalize-callback phases (§6): start and end of the sweep of each group,
/// and end of collection.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FinalizePhase {
    GroupStart,
    GroupEnd,
    CollectionEnd,
}

pub type FinalizeCallback = fn(FinalizePhase, *mut u8);
pub type WeakPointerZoneCallback = fn(*mut Zone, *mut u8);
pub type SliceCallback = fn(State, *mut u8);

// Lock-order levels: helper-thread-state < GC < exclusive-access.
#[cfg(debug_assertions)]
pub(crate) mod lock_order {
    use std::cell::Cell;

    pub const HELPER: u8 = 1;
    pub const GC: u8 = 2;
    pub const EXCLUSIVE: u8 = 3;

    thread_local! {
        static LEVEL: Cell<u8> = const { Cell::new(0) };
    }

    pub struct OrderToken {
        prev: u8,
    }

    /// Taking a lock at or below the level already held is a violation.
    pub fn acquire(level: u8) -> OrderToken {
        let prev = LEVEL.with(|l| l.get());
        assert!(
            prev < level,
            "lock order violation: level {} while holding {}",
            level,
            prev
        );
        LEVEL.with(|l| l.set(level));
        OrderToken { prev }
    }

    impl Drop for OrderToken {
        fn drop(&mut self) {
            LEVEL.with(|l| l.set(self.prev));
        }
    }
}

pub struct GcRuntime {
    pub(crate) params: GcParams,
    pool: RegionPool,
    pub(crate) marker: GcMarker,
    pub(crate) atom_marking: AtomMarkingRuntime,
    pub(crate) roots: RootLists,
    shadow_stack: ShadowStack,

    pub(crate) groups: Vec<Box<ZoneGroup>>,
    pub(crate) atoms_zone: Option<Box<Zone>>,
    heap_state: HeapState,

    // Incremental driver state.
    pub(crate) incremental_state: State,
    pub(crate) is_full: bool,
    pub(crate) sweep_groups: Vec<Vec<*mut Zone>>,
    pub(crate) current_sweep_group: usize,
    pub(crate) sweep_phase_index: usize,
    pub(crate) sweep_zone_index: usize,
    pub(crate) sweep_action_index: usize,
    pub(crate) compact_zone_cursor: usize,
    pub(crate) compact_all_requested: bool,
    /// (source region, old cell) pairs moved during the current compaction.
    pub(crate) relocated_cells: Vec<(usize, usize)>,
    pub(crate) relocated_src_regions: Vec<usize>,
    pub(crate) abort_requested: bool,
    pub(crate) last_abort: Option<AbortReason>,
    pub(crate) gc_number: u64,

    pub(crate) sweep_phases: SweepPhases,
    pub(crate) background: BackgroundFinalizer,

    // Zeal.
    pub(crate) zeal_bits: u32,
    pub(crate) zeal_frequency: u32,
    pub(crate) next_scheduled: u32,

    unsafe_region_depth: usize,
    pub(crate) active_zone_iters: usize,

    next_unique_id: u64,

    /// Interned atoms: text → atoms-zone cell.
    atoms_table: HashMap<String, usize>,
    pub(crate) permanent_atoms: Vec<*mut JsString>,
    pub(crate) well_known_symbols: Vec<*mut Symbol>,

    finalize_callbacks: Vec<(FinalizeCallback, *mut u8)>,
    weak_zone_callbacks: Vec<(WeakPointerZoneCallback, *mut u8)>,
    slice_callback: Option<(SliceCallback, *mut u8)>,

    gc_lock: parking_lot::Mutex<()>,
    exclusive_access_lock: parking_lot::Mutex<()>,

    pub(crate) stats: Statistics,
    pub(crate) verify_snapshot: Option<HashSet<usize>>,
}

impl GcRuntime {
    pub fn new(params: GcParams) -> Box<GcRuntime> {
        let zeal_bits = params.zeal_bits;
        let zeal_frequency = params.zeal_frequency;
        let background = BackgroundFinalizer::new(params.background_finalization);
        let mut rt = Box::new(GcRuntime {
            params,
            pool: RegionPool::new(),
            marker: GcMarker::new(),
            atom_marking: AtomMarkingRuntime::new(),
            roots: RootLists::new(),
            shadow_stack: ShadowStack::new(),
            groups: Vec::new(),
            atoms_zone: None,
            heap_state: HeapState::Idle,
            incremental_state: State::NotActive,
            is_full: false,
            sweep_groups: Vec::new(),
            current_sweep_group: 0,
            sweep_phase_index: 0,
            sweep_zone_index: 0,
            sweep_action_index: 0,
            compact_zone_cursor: 0,
            compact_all_requested: false,
            relocated_cells: Vec::new(),
            relocated_src_regions: Vec::new(),
            abort_requested: false,
            last_abort: None,
            gc_number: 0,
            sweep_phases: build_sweep_phases(),
            background,
            zeal_bits,
            zeal_frequency,
            next_scheduled: zeal_frequency,
            unsafe_region_depth: 0,
            active_zone_iters: 0,
            next_unique_id: 1,
            atoms_table: HashMap::new(),
            permanent_atoms: Vec::new(),
            well_known_symbols: Vec::new(),
            finalize_callbacks: Vec::new(),
            weak_zone_callbacks: Vec::new(),
            slice_callback: None,
            gc_lock: parking_lot::Mutex::new(()),
            exclusive_access_lock: parking_lot::Mutex::new(()),
            stats: Statistics::new(),
            verify_snapshot: None,
        });

        let rt_ptr = &mut *rt as *mut GcRuntime;
        rt.marker.runtime = rt_ptr;
        rt.atoms_zone = Some(Zone::new(rt_ptr, null_mut(), 0, true));
        rt.init_permanent_things();
        rt
    }

    /// Permanent atoms and the well-known symbols exist before any
    /// compartment and survive every collection.
    fn init_permanent_things(&mut self) {
        for text in ["undefined", "null", "true", "false", "length", "prototype"] {
            let atom = self
                .atomize_in_atoms_zone(text)
                .expect("out of memory during runtime initialization");
            unsafe {
                (*(atom as *mut CellHeader)).set_permanent();
            }
            self.permanent_atoms.push(atom);
        }
        for (code, name) in [(0u32, "iterator"), (1, "toStringTag")] {
            let desc = self
                .atomize_in_atoms_zone(name)
                .expect("out of memory during runtime initialization");
            unsafe {
                (*(desc as *mut CellHeader)).set_permanent();
            }
            let sym = unsafe {
                let zone = self.atoms_zone_ptr();
                let cell = self
                    .allocate_tenured(zone, AllocKind::Symbol)
                    .expect("out of memory during runtime initialization");
                let sym = cell as *mut Symbol;
                (*sym).description = desc;
                (*sym).code = code;
                (*sym)._pad = 0;
                (*cell).set_permanent();
                sym
            };
            self.well_known_symbols.push(sym);
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// The shadow stack for `letroot!`. The `'static` lifetime is a lie the
    /// rooting macro needs; the stack lives exactly as long as the runtime,
    /// which must outlive every rooted scope anyway.
    pub fn shadow_stack(&self) -> &'static ShadowStack {
        unsafe { std::mem::transmute::<&ShadowStack, &'static ShadowStack>(&self.shadow_stack) }
    }

    pub fn heap_state(&self) -> HeapState {
        self.heap_state
    }

    pub(crate) fn set_heap_state(&mut self, state: HeapState) -> HeapState {
        std::mem::replace(&mut self.heap_state, state)
    }

    pub(crate) fn region_pool_mut(&mut self) -> &mut RegionPool {
        &mut self.pool
    }

    pub(crate) fn stats_mut(&mut self) -> &mut Statistics {
        &mut self.stats
    }

    pub(crate) fn atom_marking_mut(&mut self) -> &mut AtomMarkingRuntime {
        &mut self.atom_marking
    }

    pub fn gc_number(&self) -> u64 {
        self.gc_number
    }

    pub fn state(&self) -> State {
        self.incremental_state
    }

    pub fn is_incremental_gc_in_progress(&self) -> bool {
        self.incremental_state != State::NotActive
    }

    pub(crate) fn atoms_zone_ptr(&mut self) -> *mut Zone {
        match self.atoms_zone.as_mut() {
            Some(zone) => &mut **zone as *mut Zone,
            None => null_mut(),
        }
    }

    pub(crate) fn for_each_zone(&mut self, mut f: impl FnMut(*mut Zone)) {
        for group in self.groups.iter_mut() {
            for zone in group.zones.iter_mut() {
                f(&mut **zone as *mut Zone);
            }
        }
        if let Some(zone) = self.atoms_zone.as_mut() {
            f(&mut **zone as *mut Zone);
        }
    }

    pub(crate) fn collecting_zones(&mut self) -> Vec<*mut Zone> {
        let mut zones = Vec::new();
        self.for_each_zone(|z| unsafe {
            if (*z).is_collecting() {
                zones.push(z);
            }
        });
        zones
    }

    pub fn stats(&self) -> GcStats {
        let mut allocated = 0;
        for group in self.groups.iter() {
            for zone in group.zones.iter() {
                allocated += zone.gc_bytes;
            }
        }
        if let Some(zone) = self.atoms_zone.as_ref() {
            allocated += zone.gc_bytes;
        }
        GcStats {
            allocated_bytes: allocated,
            heap_bytes: self.pool.heap_bytes(),
            live_regions: self.pool.live_regions(),
            minor_collections: self.stats.minor_collections,
            major_collections: self.stats.major_collections,
        }
    }

    // ── Locks ─────────────────────────────────────────────────────────────

    /// GC lock; must not be taken while holding the exclusive-access lock.
    pub(crate) fn with_gc_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        #[cfg(debug_assertions)]
        let _order = lock_order::acquire(lock_order::GC);
        let _guard = self.gc_lock.lock();
        f()
    }

    /// Exclusive-access lock guarding the atoms zone and atom tables.
    pub(crate) fn with_exclusive_access<R>(&self, f: impl FnOnce() -> R) -> R {
        #[cfg(debug_assertions)]
        let _order = lock_order::acquire(lock_order::EXCLUSIVE);
        let _guard = self.exclusive_access_lock.lock();
        f()
    }

    // ── Zones, groups, compartments ───────────────────────────────────────

    /// Create (or attach to) a compartment per `spec`. Freshly created
    /// groups are entered by the calling thread.
    pub fn new_compartment(&mut self, spec: ZoneSpec) -> Result<*mut Compartment, GcError> {
        let zone: *mut Zone = match spec {
            ZoneSpec::System => self.system_zone_or_create()?,
            ZoneSpec::Existing(zone) => zone,
            ZoneSpec::NewZoneInNewGroup => {
                let group = self.new_zone_group();
                unsafe { self.new_zone_in_group(group) }
            }
            ZoneSpec::NewZoneInSystemGroup => {
                self.system_zone_or_create()?;
                let group = &mut *self.groups[0] as *mut ZoneGroup;
                unsafe { self.new_zone_in_group(group) }
            }
            ZoneSpec::NewZoneInExistingGroup(group) => unsafe {
                self.new_zone_in_group(group)
            },
        };
        if self.is_incremental_gc_in_progress() {
            // A zone appearing mid-collection invalidates the snapshot.
            self.reset_incremental(AbortReason::ZoneChange);
        }
        unsafe {
            let compartment = Compartment::new(zone);
            let ptr = &*compartment as *const Compartment as *mut Compartment;
            (*zone).compartments.push(compartment);
            Ok(ptr)
        }
    }

    fn system_zone_or_create(&mut self) -> Result<*mut Zone, GcError> {
        if self.groups.is_empty() {
            let group = self.new_zone_group();
            unsafe {
                self.new_zone_in_group(group);
            }
        }
        Ok(self.groups[0].zone_ptr(0))
    }

    fn new_zone_group(&mut self) -> *mut ZoneGroup {
        let rt_ptr = self as *mut GcRuntime;
        let mut group = ZoneGroup::new(rt_ptr, self.params.nursery_bytes);
        if !self.params.generational {
            group.nursery.set_enabled(false);
            group.store_buffer.set_enabled(false);
        }
        group.enter();
        self.groups.push(group);
        &mut **self.groups.last_mut().unwrap() as *mut ZoneGroup
    }

    unsafe fn new_zone_in_group(&mut self, group: *mut ZoneGroup) -> *mut Zone {
        let rt_ptr = self as *mut GcRuntime;
        let index = (*group).zones.len() as u16;
        let zone = Zone::new(rt_ptr, group, index, false);
        (*group).zones.push(zone);
        (*group).zone_ptr(index)
    }

    pub fn system_zone(&mut self) -> Option<*mut Zone> {
        if self.groups.is_empty() || self.groups[0].zones.is_empty() {
            None
        } else {
            Some(self.groups[0].zone_ptr(0))
        }
    }

    /// Queue a zone for teardown. Forbidden during zone iteration; an
    /// in-flight incremental collection resets at its next slice boundary.
    pub fn schedule_zone_destruction(&mut self, zone: *mut Zone) {
        assert_eq!(
            self.active_zone_iters, 0,
            "zone teardown while zone iteration is active"
        );
        unsafe {
            (*zone).destroy_scheduled = true;
        }
    }

    /// Guard zones and compartments against teardown while the embedding
    /// iterates them.
    pub fn begin_zone_iteration(&mut self) {
        self.active_zone_iters += 1;
    }

    pub fn end_zone_iteration(&mut self) {
        debug_assert!(self.active_zone_iters > 0);
        self.active_zone_iters -= 1;
    }

    /// Present every root to a host callback without collecting anything.
    pub fn trace_runtime(
        &mut self,
        callback: &mut dyn FnMut(*mut CellHeader, TraceKind, &'static str),
    ) {
        let prev = self.set_heap_state(HeapState::Tracing);
        let mut trc = super::tracer::CallbackTracer { callback };
        self.trace_black_roots(&mut trc);
        self.trace_gray_roots(&mut trc);
        self.set_heap_state(prev);
    }

    // ── Allocation: tenured core ──────────────────────────────────────────

    /// Tenured slow path: bump the zone's cursor region, then any region
    /// with free cells, then a fresh region.
    pub(crate) unsafe fn allocate_tenured(
        &mut self,
        zone: *mut Zone,
        kind: AllocKind,
    ) -> Result<*mut CellHeader, GcError> {
        let index = kind.index();
        let cursor = (*zone).alloc_cursor[index];
        if !cursor.is_null() {
            if let Some(cell) = (*cursor).alloc_cell() {
                return Ok(self.finish_tenured_cell(zone, kind, cell));
            }
        }
        let mut region = (*zone).regions[index];
        while !region.is_null() {
            if let Some(cell) = (*region).alloc_cell() {
                (*zone).alloc_cursor[index] = region;
                return Ok(self.finish_tenured_cell(zone, kind, cell));
            }
            region = (*region).next;
        }
        if self.pool.heap_bytes() >= self.params.max_heap_bytes {
            return Err(GcError::OutOfMemory);
        }
        let atom_base = if (*zone).is_atoms_zone {
            let capacity = REGION_PAYLOAD / size_of_kind(kind);
            self.atom_marking.reserve_region_indexes(capacity)
        } else {
            0
        };
        let region = self.pool.alloc_region(
            kind,
            zone,
            (*zone).group,
            RegionFlags::empty(),
            atom_base,
        )?;
        (*zone).push_region(region);
        (*zone).alloc_cursor[index] = region;
        let cell = (*region).alloc_cell().ok_or(GcError::OutOfMemory)?;
        Ok(self.finish_tenured_cell(zone, kind, cell))
    }

    unsafe fn finish_tenured_cell(
        &mut self,
        zone: *mut Zone,
        kind: AllocKind,
        cell: *mut CellHeader,
    ) -> *mut CellHeader {
        (*cell).init(kind, (*zone).index_in_group);
        if (*zone).is_marking() {
            // Cells born during an incremental mark are black: the snapshot
            // predates them, so sweep must not look at them.
            (*cell).mark_if_unmarked(CellColor::Black);
        }
        (*zone).add_gc_bytes(size_of_kind(kind));
        cell
    }

    /// Promotion allocation for minor GC: no allocator-state checks, no
    /// triggers; minor GC is already running.
    pub(crate) unsafe fn allocate_promoted_cell(
        &mut self,
        zone: *mut Zone,
        kind: AllocKind,
    ) -> Result<*mut CellHeader, GcError> {
        self.allocate_tenured(zone, kind)
    }

    // ── Allocation: public object model surface ───────────────────────────

    pub fn allocate_object(
        &mut self,
        compartment: *mut Compartment,
        nslots: usize,
        background_finalizable: bool,
        heap: InitialHeap,
    ) -> Result<Gc<JsObject>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let kind = object_kind_for_slots(nslots, background_finalizable);
            let group = self.initial_group(compartment)?;
            let shape = self.initial_shape(compartment)?;
            let cell = self.allocate_cell(zone, kind, heap)?;
            let obj = cell as *mut JsObject;
            JsObject::init(obj, kind, shape, group);
            Ok(Gc::from_raw(obj))
        }
    }

    /// The per-compartment primordial group; created on first use. The
    /// cache is swept weakly, so a hit during incremental marking must mark
    /// the cell (nothing else in the snapshot may reference it).
    unsafe fn initial_group(
        &mut self,
        compartment: *mut Compartment,
    ) -> Result<*mut ObjectGroup, GcError> {
        if let Some(group) = self.compartment_initial_group(compartment) {
            super::barrier::pre_write_barrier(group as *mut CellHeader);
            return Ok(group);
        }
        let zone = (*compartment).zone;
        let cell = self.allocate_tenured(zone, AllocKind::ObjectGroup)?;
        let group = cell as *mut ObjectGroup;
        (*group).proto = null_mut();
        (*group).descriptor = null_mut();
        (*group).compartment = compartment;
        self.set_compartment_initial_group(compartment, group);
        Ok(group)
    }

    unsafe fn initial_shape(
        &mut self,
        compartment: *mut Compartment,
    ) -> Result<*mut Shape, GcError> {
        if let Some(shape) = self.compartment_initial_shape(compartment) {
            super::barrier::pre_write_barrier(shape as *mut CellHeader);
            return Ok(shape);
        }
        let zone = (*compartment).zone;
        let base_cell = self.allocate_tenured(zone, AllocKind::BaseShape)?;
        let base = base_cell as *mut super::cells::BaseShape;
        (*base).flags = 0;
        (*base)._pad = 0;
        (*base).proto = null_mut();
        let cell = self.allocate_tenured(zone, AllocKind::Shape)?;
        let shape = cell as *mut Shape;
        (*shape).base = base;
        (*shape).parent = null_mut();
        (*shape).prop_atom = null_mut();
        (*shape).slot = 0;
        (*shape).attrs = 0;
        self.set_compartment_initial_shape(compartment, shape);
        Ok(shape)
    }

    unsafe fn compartment_initial_group(
        &self,
        compartment: *mut Compartment,
    ) -> Option<*mut ObjectGroup> {
        let g = (*compartment).initial_group;
        if g.is_null() {
            None
        } else {
            Some(g)
        }
    }

    unsafe fn set_compartment_initial_group(
        &mut self,
        compartment: *mut Compartment,
        group: *mut ObjectGroup,
    ) {
        (*compartment).initial_group = group;
    }

    unsafe fn compartment_initial_shape(
        &self,
        compartment: *mut Compartment,
    ) -> Option<*mut Shape> {
        let s = (*compartment).initial_shape;
        if s.is_null() {
            None
        } else {
            Some(s)
        }
    }

    unsafe fn set_compartment_initial_shape(
        &mut self,
        compartment: *mut Compartment,
        shape: *mut Shape,
    ) {
        (*compartment).initial_shape = shape;
    }

    /// Allocate a linear string in the compartment's zone.
    pub fn allocate_string(
        &mut self,
        compartment: *mut Compartment,
        text: &str,
    ) -> Result<Gc<JsString>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let inline = text.len() <= INLINE_STRING_CAPACITY;
            let kind = if inline {
                AllocKind::InlineString
            } else {
                AllocKind::String
            };
            let cell = self.allocate_cell(zone, kind, InitialHeap::Default)?;
            let s = cell as *mut JsString;
            JsString::init_linear(s, text, inline, false);
            if !inline {
                (*zone).update_malloc_bytes(text.len());
            }
            Ok(Gc::from_raw(s))
        }
    }

    pub fn allocate_rope(
        &mut self,
        compartment: *mut Compartment,
        left: Gc<JsString>,
        right: Gc<JsString>,
    ) -> Result<Gc<JsString>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::String, InitialHeap::Default)?;
            let s = cell as *mut JsString;
            JsString::init_rope(s, left.as_ptr(), right.as_ptr());
            super::barrier::post_write_barrier(
                cell,
                &mut (*s).left as *mut *mut JsString as *mut *mut CellHeader,
                left.as_cell(),
            );
            super::barrier::post_write_barrier(
                cell,
                &mut (*s).right as *mut *mut JsString as *mut *mut CellHeader,
                right.as_cell(),
            );
            Ok(Gc::from_raw(s))
        }
    }

    pub fn allocate_external_string(
        &mut self,
        compartment: *mut Compartment,
        data: *mut u8,
        len: usize,
        free: unsafe fn(*mut u8, usize),
    ) -> Result<Gc<JsString>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::ExternalString, InitialHeap::Tenured)?;
            let s = cell as *mut JsString;
            JsString::init_external(s, data, len, free);
            Ok(Gc::from_raw(s))
        }
    }

    fn atomize_in_atoms_zone(&mut self, text: &str) -> Result<*mut JsString, GcError> {
        if let Some(&cell) = self.atoms_table.get(text) {
            return Ok(cell as *mut JsString);
        }
        let inline = text.len() <= INLINE_STRING_CAPACITY;
        let kind = if inline {
            AllocKind::InlineAtom
        } else {
            AllocKind::Atom
        };
        unsafe {
            let zone = self.atoms_zone_ptr();
            let cell = self.allocate_tenured(zone, kind)?;
            let s = cell as *mut JsString;
            JsString::init_linear(s, text, inline, true);
            self.atoms_table.insert(text.to_string(), s as usize);
            Ok(s)
        }
    }

    /// Intern `text` and record the interest of `zone` in its atom bitmap.
    pub fn atomize(&mut self, zone: *mut Zone, text: &str) -> Result<Gc<JsString>, GcError> {
        let rt = self as *mut GcRuntime;
        unsafe {
            (*rt).with_exclusive_access(|| {
                let atom = (*rt).atomize_in_atoms_zone(text)?;
                let cell = atom as *mut CellHeader;
                if !zone.is_null() && !(*cell).is_permanent() {
                    (*zone).atom_bitmap.set(atom_index(cell));
                }
                Ok(Gc::from_raw(atom))
            })
        }
    }

    pub fn allocate_symbol(
        &mut self,
        zone: *mut Zone,
        description: Gc<JsString>,
    ) -> Result<Gc<Symbol>, GcError> {
        let rt = self as *mut GcRuntime;
        unsafe {
            (*rt).with_exclusive_access(|| {
                let atoms_zone = (*rt).atoms_zone_ptr();
                let cell = (*rt).allocate_tenured(atoms_zone, AllocKind::Symbol)?;
                let sym = cell as *mut Symbol;
                (*sym).description = description.as_ptr();
                (*sym).code = u32::MAX;
                (*sym)._pad = 0;
                if !zone.is_null() {
                    (*zone).atom_bitmap.set(atom_index(cell));
                }
                Ok(Gc::from_raw(sym))
            })
        }
    }

    pub fn allocate_script(
        &mut self,
        compartment: *mut Compartment,
        source: Option<Gc<JsString>>,
        scope: Option<Gc<Scope>>,
        inner: Vec<Gc<Script>>,
    ) -> Result<Gc<Script>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::Script, InitialHeap::Tenured)?;
            let script = cell as *mut Script;
            let inner: Box<[*mut Script]> = inner.iter().map(|s| s.as_ptr()).collect();
            Script::init(
                script,
                source.map_or(null_mut(), |s| s.as_ptr()),
                scope.map_or(null_mut(), |s| s.as_ptr()),
                inner,
            );
            Ok(Gc::from_raw(script))
        }
    }

    pub fn allocate_scope(
        &mut self,
        compartment: *mut Compartment,
        enclosing: Option<Gc<Scope>>,
        names: Vec<Gc<JsString>>,
        kind: u32,
    ) -> Result<Gc<Scope>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::Scope, InitialHeap::Default)?;
            let scope = cell as *mut Scope;
            let names: Box<[*mut JsString]> = names.iter().map(|s| s.as_ptr()).collect();
            Scope::init(
                scope,
                enclosing.map_or(null_mut(), |s| s.as_ptr()),
                names,
                kind,
            );
            Ok(Gc::from_raw(scope))
        }
    }

    pub fn allocate_lazy_script(
        &mut self,
        compartment: *mut Compartment,
        script: Option<Gc<Script>>,
        scope: Option<Gc<Scope>>,
        source: Option<Gc<JsString>>,
    ) -> Result<Gc<super::cells::LazyScript>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::LazyScript, InitialHeap::Tenured)?;
            let lazy = cell as *mut super::cells::LazyScript;
            (*lazy).script = script.map_or(null_mut(), |s| s.as_ptr());
            (*lazy).scope = scope.map_or(null_mut(), |s| s.as_ptr());
            (*lazy).source = source.map_or(null_mut(), |s| s.as_ptr());
            Ok(Gc::from_raw(lazy))
        }
    }

    pub fn allocate_regexp_shared(
        &mut self,
        compartment: *mut Compartment,
        source: Gc<JsString>,
        flags: u32,
    ) -> Result<Gc<super::cells::RegExpShared>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::RegExpShared, InitialHeap::Tenured)?;
            let re = cell as *mut super::cells::RegExpShared;
            (*re).source = source.as_ptr();
            (*re).flags = flags;
            (*re)._pad = 0;
            Ok(Gc::from_raw(re))
        }
    }

    pub fn allocate_jit_code(
        &mut self,
        compartment: *mut Compartment,
        script: Option<Gc<Script>>,
        code: Vec<u8>,
    ) -> Result<Gc<super::cells::JitCode>, GcError> {
        unsafe {
            let zone = (*compartment).zone;
            let cell = self.allocate_cell(zone, AllocKind::JitCode, InitialHeap::Tenured)?;
            let jit = cell as *mut super::cells::JitCode;
            (*jit).script = script.map_or(null_mut(), |s| s.as_ptr());
            (*jit).code_size = code.len() as u32;
            (*jit)._pad = 0;
            (*jit).code = if code.is_empty() {
                null_mut()
            } else {
                (*zone).update_malloc_bytes(code.len());
                Box::into_raw(code.into_boxed_slice()) as *mut u8
            };
            Ok(Gc::from_raw(jit))
        }
    }

    /// Register a generic remembered-set entry with a zone group's store
    /// buffer. One entry may stand for many edges; minor GC calls its
    /// `trace` and then forgets it.
    pub fn remember_generic(
        &mut self,
        zone: *mut Zone,
        entry: Box<dyn super::store_buffer::BufferableRef>,
    ) {
        unsafe {
            let group = (*zone).group;
            if !group.is_null() {
                (*group).store_buffer.put_generic(entry);
            }
        }
    }

    /// Create a cross-compartment wrapper in `compartment` for `target` and
    /// register it in the wrapper map.
    pub fn new_wrapper(
        &mut self,
        compartment: *mut Compartment,
        target: *mut CellHeader,
    ) -> Result<Gc<JsObject>, GcError> {
        unsafe {
            let obj = self.allocate_object(compartment, 1, true, InitialHeap::Tenured)?;
            let mut obj = obj;
            obj.flags |= OBJ_FLAG_WRAPPER;
            JsObject::set_slot(obj, 0, Value::cell(target));
            (*compartment).wrappers.insert(target as usize, obj.as_ptr());
            Ok(obj)
        }
    }

    /// Move an object's overflow slots to a bigger buffer.
    pub fn grow_object_slots(
        &mut self,
        obj: Gc<JsObject>,
        new_capacity: usize,
    ) -> Result<(), GcError> {
        unsafe {
            let o = obj.as_ptr();
            let old_cap = (*o).dyn_capacity as usize;
            if new_capacity <= old_cap {
                return Ok(());
            }
            let mut buf: Box<[Value]> = vec![Value::undefined(); new_capacity].into();
            if !(*o).dyn_slots.is_null() {
                std::ptr::copy_nonoverlapping((*o).dyn_slots, buf.as_mut_ptr(), old_cap);
            }
            let new_ptr = Box::into_raw(buf) as *mut Value;
            let old_ptr = (*o).dyn_slots;
            (*o).dyn_slots = new_ptr;
            (*o).dyn_capacity = new_capacity as u32;
            let zone = super::region::zone_of(obj.as_cell());
            if !zone.is_null() {
                (*zone).update_malloc_bytes(new_capacity * std::mem::size_of::<Value>());
            }

            let cell = obj.as_cell();
            let group = (*super::region::region_of(cell)).group;
            if in_nursery(cell) {
                (*group).nursery.register_values_buffer(new_ptr, new_capacity);
                if !old_ptr.is_null() {
                    (*group).nursery.unregister_buffer(old_ptr as *mut u8);
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        old_ptr, old_cap,
                    )));
                }
            } else {
                // Old slot addresses may sit in the store buffer; keep the
                // buffer alive until the next minor GC and re-present the
                // whole cell instead.
                if !old_ptr.is_null() {
                    (*group).nursery.register_values_buffer(old_ptr, old_cap);
                }
                super::barrier::post_write_barrier_whole_cell(cell);
            }
            Ok(())
        }
    }

    // ── Weak maps ─────────────────────────────────────────────────────────

    pub fn new_weak_map(&mut self, zone: *mut Zone) -> WeakMapRef {
        unsafe {
            let map = WeakMap::new(zone);
            let ptr = &*map as *const WeakMap as *mut WeakMap;
            (*zone).weak_maps.push(map);
            WeakMapRef(ptr)
        }
    }

    /// Insert into a weak map. Nursery keys or values force an eviction
    /// first so the map never holds nursery pointers.
    pub fn weak_map_set(&mut self, map: WeakMapRef, key: *mut CellHeader, value: Value) {
        unsafe {
            let mut key = key;
            let mut value = value;
            let key_young = in_nursery(key);
            let value_young = value.as_cell().map_or(false, |c| in_nursery(c));
            if key_young || value_young {
                self.evict_nursery(GcReason::Api);
                key = super::nursery::forwarded_or_self(key);
                if let Some(cell) = value.as_cell() {
                    value = Value::cell(super::nursery::forwarded_or_self(cell));
                }
            }
            (*map.0).set(key, value);
        }
    }

    // ── Roots ─────────────────────────────────────────────────────────────

    /// Register a persistent root. The slot is visited on every root trace
    /// until removed.
    pub fn add_persistent(&mut self, kind: TraceKind, root: &PersistentRooted) {
        unsafe {
            self.roots.add_persistent(kind, root);
        }
    }

    pub fn remove_persistent(&mut self, kind: TraceKind, root: &PersistentRooted) {
        unsafe {
            self.roots.remove_persistent(kind, root);
        }
    }

    pub fn add_black_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.roots.add_black_tracer(op, data);
    }

    pub fn remove_black_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.roots.remove_black_tracer(op, data);
    }

    pub fn set_gray_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.roots.set_gray_tracer(op, data);
    }

    /// Visit every black root exactly once under a heap-busy token.
    pub(crate) fn trace_black_roots(&mut self, trc: &mut dyn Tracer) {
        debug_assert!(self.heap_state != HeapState::Idle);
        self.shadow_stack.trace(trc);
        let roots = &mut self.roots as *mut RootLists;
        unsafe {
            (*roots).trace_black_roots(trc);
        }
    }

    pub(crate) fn trace_gray_roots(&mut self, trc: &mut dyn Tracer) {
        debug_assert!(self.heap_state != HeapState::Idle);
        let roots = &mut self.roots as *mut RootLists;
        unsafe {
            (*roots).trace_gray_roots(trc);
        }
    }

    /// Minor GC visits the same roots; tenuring rewrites them in place.
    pub(crate) fn trace_roots_for_minor_gc(&mut self, trc: &mut dyn Tracer) {
        let prev = self.set_heap_state(HeapState::MinorCollecting);
        self.trace_black_roots(trc);
        self.trace_gray_roots(trc);
        self.set_heap_state(prev);
    }

    /// Drop intern-table entries for atoms that did not survive. Must run
    /// while the dead cells' headers are still intact.
    pub(crate) unsafe fn prune_atoms_table(&mut self) {
        self.atoms_table.retain(|_, &mut cell| {
            let cell = cell as *mut CellHeader;
            (*cell).is_permanent() || (*cell).is_marked_any()
        });
    }

    // ── Unique ids ────────────────────────────────────────────────────────

    /// Stable id for a cell; assigned on first request. Survives moves
    /// because the table is rekeyed during compaction.
    pub fn get_unique_id(&mut self, cell: *mut CellHeader) -> u64 {
        unsafe {
            let zone = super::region::zone_of(cell);
            debug_assert!(!zone.is_null());
            if (*cell).has_uid() {
                if let Some(&id) = (*zone).unique_ids.get(&(cell as usize)) {
                    return id;
                }
            }
            let id = self.next_unique_id;
            self.next_unique_id += 1;
            (*zone).unique_ids.insert(cell as usize, id);
            (*cell).set_has_uid();
            id
        }
    }

    // ── Unsafe-for-GC regions ─────────────────────────────────────────────

    pub fn enter_unsafe_region(&mut self) {
        self.unsafe_region_depth += 1;
    }

    pub fn leave_unsafe_region(&mut self) {
        debug_assert!(self.unsafe_region_depth > 0);
        self.unsafe_region_depth -= 1;
    }

    pub(crate) fn in_unsafe_region(&self) -> bool {
        self.unsafe_region_depth > 0
    }

    // ── Callbacks ─────────────────────────────────────────────────────────

    pub fn add_finalize_callback(&mut self, cb: FinalizeCallback, data: *mut u8) {
        self.finalize_callbacks.push((cb, data));
    }

    pub fn add_weak_pointer_zone_callback(&mut self, cb: WeakPointerZoneCallback, data: *mut u8) {
        self.weak_zone_callbacks.push((cb, data));
    }

    pub fn set_slice_callback(&mut self, cb: SliceCallback, data: *mut u8) {
        self.slice_callback = Some((cb, data));
    }

    pub(crate) fn call_finalize_callbacks(&mut self, phase: FinalizePhase) {
        let callbacks = self.finalize_callbacks.clone();
        for (cb, data) in callbacks {
            cb(phase, data);
        }
    }

    pub(crate) fn call_weak_zone_callbacks(&mut self, zone: *mut Zone) {
        let callbacks = self.weak_zone_callbacks.clone();
        for (cb, data) in callbacks {
            cb(zone, data);
        }
    }

    pub(crate) fn call_slice_callback(&mut self) {
        if let Some((cb, data)) = self.slice_callback {
            cb(self.incremental_state, data);
        }
    }

    // ── Nursery ───────────────────────────────────────────────────────────

    /// Run minor GC synchronously on every zone group.
    pub fn evict_nursery(&mut self, reason: GcReason) {
        let rt = self as *mut GcRuntime;
        let prev = self.set_heap_state(HeapState::MinorCollecting);
        self.stats.begin_phase(super::statistics::Phase::MinorGc);
        unsafe {
            for i in 0..(*rt).groups.len() {
                let group = &mut *(&mut (*rt).groups)[i] as *mut ZoneGroup;
                minor_gc(rt, group, reason);
            }
        }
        self.stats.end_phase(super::statistics::Phase::MinorGc);
        self.set_heap_state(prev);
    }

    pub(crate) fn any_group_wants_minor_gc(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.store_buffer.wants_minor_gc())
    }

    // ── Zeal ──────────────────────────────────────────────────────────────

    pub fn set_zeal(&mut self, mode: ZealMode, frequency: u32) {
        self.zeal_bits |= 1 << mode as u32;
        self.zeal_frequency = frequency;
        self.next_scheduled = frequency;
    }

    pub fn clear_zeal(&mut self) {
        self.zeal_bits = 0;
    }

    pub fn parse_and_set_zeal(&mut self, spec: &str) -> Result<(), crate::options::BadZealSpec> {
        let params = GcParams::default().parse_zeal(spec)?;
        self.zeal_bits = params.zeal_bits;
        self.zeal_frequency = params.zeal_frequency;
        self.next_scheduled = params.zeal_frequency;
        Ok(())
    }

    pub(crate) fn has_zeal(&self, mode: ZealMode) -> bool {
        self.zeal_bits & (1 << mode as u32) != 0
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Finalize every remaining cell. Runs at runtime drop.
    unsafe fn finalize_everything(&mut self) {
        let rt = self as *mut GcRuntime;
        (*rt).for_each_zone(|zone| {
            for kind in AllocKind::ALL {
                for region in (*zone).iter_regions(kind) {
                    for cell in (*region).iter_cells() {
                        finalize_cell(cell, kind);
                    }
                }
            }
        });
        for i in 0..(*rt).groups.len() {
            let group = &mut *(&mut (*rt).groups)[i] as *mut ZoneGroup;
            let pool = (*rt).region_pool_mut() as *mut RegionPool;
            (*group).nursery.sweep(&mut *pool);
        }
    }
}

impl Drop for GcRuntime {
    fn drop(&mut self) {
        self.background.shutdown();
        unsafe {
            self.finalize_everything();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_things_exist_at_startup() {
        let rt = GcRuntime::new(GcParams::default());
        assert!(!rt.permanent_atoms.is_empty());
        assert_eq!(rt.well_known_symbols.len(), 2);
        for &atom in &rt.permanent_atoms {
            unsafe {
                assert!((*(atom as *mut CellHeader)).is_permanent());
            }
        }
    }

    #[test]
    fn locks_taken_in_order_are_fine() {
        let rt = GcRuntime::new(GcParams::default());
        rt.with_gc_lock(|| {});
        rt.with_exclusive_access(|| {});
        rt.with_gc_lock(|| rt.with_exclusive_access(|| {}));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn lock_order_violations_are_fatal() {
        let rt = GcRuntime::new(GcParams::default());
        rt.with_exclusive_access(|| {
            rt.with_gc_lock(|| {});
        });
    }

    #[test]
    fn unique_ids_are_stable_and_distinct() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let a = rt
            .allocate_object(compartment, 0, true, InitialHeap::Tenured)
            .unwrap();
        let b = rt
            .allocate_object(compartment, 0, true, InitialHeap::Tenured)
            .unwrap();
        let id_a = rt.get_unique_id(a.as_cell());
        let id_b = rt.get_unique_id(b.as_cell());
        assert_ne!(id_a, id_b);
        assert_eq!(rt.get_unique_id(a.as_cell()), id_a);
    }

    #[test]
    fn allocation_is_refused_in_unsafe_regions() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        rt.enter_unsafe_region();
        let err = rt
            .allocate_object(compartment, 0, true, InitialHeap::Default)
            .unwrap_err();
        assert_eq!(err, GcError::UnsafeRegion);
        rt.leave_unsafe_region();
        assert!(rt
            .allocate_object(compartment, 0, true, InitialHeap::Default)
            .is_ok());
    }
}

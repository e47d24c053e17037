//! The marker: an explicit, budgeted, tagged mark stack.
//!
//! Cells fall in two camps. Objects, object groups, scripts and jit code go
//! through the stack so slot scanning can pause at a budget boundary.
//! Strings, shapes, scopes, lazy scripts, symbols and regexp shareds are
//! marked *eagerly* on the stack-local path — their shapes are chains and
//! small fans, so walking them inline beats paying a stack entry per cell.
//! Ropes get a dedicated tag so only the right spine costs stack space.
//!
//! The stack grows geometrically to a cap; past the cap the offending
//! cell's whole region is flagged for delayed marking and rescanned later.
//!
//! Mid-array slice exhaustion leaves `ValueArray` entries on the stack;
//! `save_value_arrays` converts them to index form before the mutator runs
//! again (slot buffers may be reallocated between slices), and processing
//! restores them or falls back to re-pushing the owning object.

use hashbrown::HashMap;

use super::atom_marking::atom_index;
use super::cell::{CellColor, CellHeader};
use super::cells::{JsObject, JsString, LazyScript, ObjectGroup, Scope, Script, Shape};
use super::driver::SliceBudget;
use super::kinds::{trace_kind_of, TraceKind};
use super::region::{region_of, zone_of, RegionFlags, RegionHeader};
use super::runtime::GcRuntime;
use super::tracer::{trace_children, Tracer, TracerVariant};
use super::value::Value;
use super::weak_map::WeakMap;
use super::zone::Zone;

const DEFAULT_MARK_STACK_MAX: usize = 1 << 15;
/// Slots scanned per value-array step before the entry is re-pushed.
const VALUE_ARRAY_CHUNK: usize = 64;
#[cfg(debug_assertions)]
const ROPE_RING: usize = 100;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SlotsKind {
    Inline,
    Dynamic,
}

#[derive(Copy, Clone, Debug)]
pub enum MarkStackEntry {
    Object(*mut JsObject),
    Group(*mut ObjectGroup),
    JitCode(*mut super::cells::JitCode),
    Script(*mut Script),
    /// A slot range still to scan. Pointer form; only valid within a slice.
    ValueArray {
        obj: *mut JsObject,
        start: *mut Value,
        end: *mut Value,
    },
    /// Index form of `ValueArray`, safe across slice boundaries where the
    /// mutator may reallocate the slot buffer.
    SavedValueArray {
        obj: *mut JsObject,
        index: usize,
        kind: SlotsKind,
    },
    /// Right spine of a rope being marked inline.
    TempRope(*mut JsString),
}

pub struct GcMarker {
    pub(crate) runtime: *mut GcRuntime,
    stack: Vec<MarkStackEntry>,
    max_capacity: usize,
    /// Regions whose marked cells still need their children traced because
    /// the stack was full when we got to them.
    delayed: *mut RegionHeader,
    color: CellColor,
    weak_marking: bool,
    /// Unmarked weak-map key → maps holding it. Marking the key propagates
    /// eagerly to the values.
    weak_keys: HashMap<usize, Vec<*mut WeakMap>>,
    current_source: *mut CellHeader,
    pub(crate) cells_marked: usize,
    #[cfg(debug_assertions)]
    rope_ring: [usize; ROPE_RING],
    #[cfg(debug_assertions)]
    rope_ring_pos: usize,
}

impl GcMarker {
    pub fn new() -> GcMarker {
        GcMarker {
            runtime: std::ptr::null_mut(),
            stack: Vec::new(),
            max_capacity: DEFAULT_MARK_STACK_MAX,
            delayed: std::ptr::null_mut(),
            color: CellColor::Black,
            weak_marking: false,
            weak_keys: HashMap::new(),
            current_source: std::ptr::null_mut(),
            cells_marked: 0,
            #[cfg(debug_assertions)]
            rope_ring: [0; ROPE_RING],
            #[cfg(debug_assertions)]
            rope_ring_pos: 0,
        }
    }

    pub fn start(&mut self) {
        debug_assert!(self.stack.is_empty());
        debug_assert!(self.delayed.is_null());
        self.cells_marked = 0;
        self.color = CellColor::Black;
    }

    /// Throw away all marking state (incremental reset).
    pub unsafe fn reset(&mut self) {
        self.stack.clear();
        let mut region = self.delayed;
        while !region.is_null() {
            let next = (*region).delayed_link;
            (*region).flags.remove(RegionFlags::DELAYED_MARKING);
            (*region).delayed_link = std::ptr::null_mut();
            region = next;
        }
        self.delayed = std::ptr::null_mut();
        self.weak_marking = false;
        self.weak_keys.clear();
        self.color = CellColor::Black;
        self.current_source = std::ptr::null_mut();
    }

    pub fn color(&self) -> CellColor {
        self.color
    }

    pub fn set_color(&mut self, color: CellColor) {
        debug_assert!(color != CellColor::White);
        self.color = color;
    }

    pub fn is_drained(&self) -> bool {
        self.stack.is_empty() && self.delayed.is_null()
    }

    #[cfg(test)]
    pub(crate) fn set_max_capacity(&mut self, cap: usize) {
        self.max_capacity = cap;
    }

    /// Mark a root edge (no source cell).
    pub unsafe fn mark_root_cell(&mut self, cell: *mut CellHeader) {
        self.current_source = std::ptr::null_mut();
        self.mark_cell(cell);
    }

    /// Pre-barrier entry: mark the overwritten value black and queue its
    /// children, whatever color phase the marker is in.
    pub unsafe fn mark_black_from_barrier(&mut self, cell: *mut CellHeader) {
        let prev = self.color;
        self.color = CellColor::Black;
        self.current_source = std::ptr::null_mut();
        self.mark_cell(cell);
        self.color = prev;
    }

    unsafe fn mark_cell(&mut self, cell: *mut CellHeader) {
        debug_assert!(!cell.is_null());
        if (*cell).is_permanent() {
            return;
        }
        let region = region_of(cell);
        if (*region).is_nursery() {
            // Only minor GC deals in nursery cells; the nursery is evicted
            // before a major mark begins.
            return;
        }
        let zone = (*region).zone;
        if zone.is_null() {
            return;
        }
        if (*zone).is_atoms_zone {
            self.note_atom_reference(cell);
        }
        if self.color == CellColor::Gray && !self.current_source.is_null() {
            let src_group = (*region_of(self.current_source)).group;
            if src_group != (*region).group {
                self.divert_gray_cross_group(cell);
                return;
            }
        }
        if !(*zone).is_collecting() {
            return;
        }
        if !(*cell).mark_if_unmarked(self.color) {
            return;
        }
        self.cells_marked += 1;
        if self.weak_marking {
            self.propagate_weak_entries(cell);
        }
        self.traverse(cell);
    }

    /// A gray edge crossing a zone-group boundary is not followed. The
    /// referring wrapper goes on the destination compartment's
    /// incoming-gray list instead; the slice epilogue drains those lists.
    unsafe fn divert_gray_cross_group(&mut self, target: *mut CellHeader) {
        let src = self.current_source;
        if src.is_null() || trace_kind_of((*src).kind()) != TraceKind::Object {
            return;
        }
        let wrapper = src as *mut JsObject;
        if !(*wrapper).is_wrapper() {
            return;
        }
        let compartment = if trace_kind_of((*target).kind()) == TraceKind::Object {
            let group = (*(target as *mut JsObject)).group;
            if group.is_null() {
                std::ptr::null_mut()
            } else {
                (*group).compartment
            }
        } else {
            std::ptr::null_mut()
        };
        let zone = zone_of(target);
        let compartment = if compartment.is_null() {
            match (*zone).compartments.first() {
                Some(c) => &**c as *const _ as *mut super::zone::Compartment,
                None => return,
            }
        } else {
            compartment
        };
        (*compartment).incoming_gray.push(wrapper);
    }

    unsafe fn note_atom_reference(&mut self, cell: *mut CellHeader) {
        let index = atom_index(cell);
        let src = self.current_source;
        if !src.is_null() {
            let src_zone = zone_of(src);
            if !src_zone.is_null() && !(*src_zone).is_atoms_zone {
                (*src_zone).atom_bitmap.set(index);
                return;
            }
        }
        (*(*self.runtime).atom_marking_mut()).roots_bitmap.set(index);
    }

    unsafe fn propagate_weak_entries(&mut self, key: *mut CellHeader) {
        if let Some(maps) = self.weak_keys.remove(&(key as usize)) {
            let src = self.current_source;
            for map in maps {
                if let Some(value) = (*map).entries.get(&(key as usize)).copied() {
                    if let Some(cell) = value.as_cell() {
                        self.current_source = key;
                        self.mark_cell(cell);
                    }
                }
            }
            self.current_source = src;
        }
    }

    unsafe fn traverse(&mut self, cell: *mut CellHeader) {
        match trace_kind_of((*cell).kind()) {
            TraceKind::Object => self.push_or_delay(MarkStackEntry::Object(cell as *mut JsObject)),
            TraceKind::ObjectGroup => {
                self.push_or_delay(MarkStackEntry::Group(cell as *mut ObjectGroup))
            }
            TraceKind::Script => self.push_or_delay(MarkStackEntry::Script(cell as *mut Script)),
            TraceKind::JitCode => {
                self.push_or_delay(MarkStackEntry::JitCode(cell as *mut super::cells::JitCode))
            }
            TraceKind::String | TraceKind::Atom => self.walk_rope(cell as *mut JsString),
            TraceKind::ExternalString => {}
            TraceKind::Shape | TraceKind::AccessorShape => {
                self.walk_shape_chain(cell as *mut Shape)
            }
            TraceKind::BaseShape => {
                let base = cell as *mut super::cells::BaseShape;
                self.current_source = cell;
                if !(*base).proto.is_null() {
                    self.mark_cell((*base).proto as *mut CellHeader);
                }
            }
            TraceKind::Scope => self.walk_scope_chain(cell as *mut Scope),
            TraceKind::LazyScript => {
                let lazy = cell as *mut LazyScript;
                self.current_source = cell;
                if !(*lazy).script.is_null() {
                    self.mark_cell((*lazy).script as *mut CellHeader);
                }
                if !(*lazy).scope.is_null() {
                    self.mark_cell((*lazy).scope as *mut CellHeader);
                }
                if !(*lazy).source.is_null() {
                    self.mark_cell((*lazy).source as *mut CellHeader);
                }
            }
            TraceKind::Symbol => {
                let sym = cell as *mut super::cells::Symbol;
                self.current_source = cell;
                if !(*sym).description.is_null() {
                    self.mark_cell((*sym).description as *mut CellHeader);
                }
            }
            TraceKind::RegExpShared => {
                let re = cell as *mut super::cells::RegExpShared;
                self.current_source = cell;
                if !(*re).source.is_null() {
                    self.mark_cell((*re).source as *mut CellHeader);
                }
            }
        }
    }

    #[cfg(debug_assertions)]
    unsafe fn rope_ring_check(&mut self, rope: *mut JsString) {
        assert!(
            !self.rope_ring.contains(&(rope as usize)),
            "rope cycle while marking"
        );
        self.rope_ring[self.rope_ring_pos] = rope as usize;
        self.rope_ring_pos = (self.rope_ring_pos + 1) % ROPE_RING;
    }

    /// Mark a rope's tree without a stack entry per node: walk the left
    /// spine in a loop, push only rope right children.
    unsafe fn walk_rope(&mut self, s: *mut JsString) {
        #[cfg(debug_assertions)]
        {
            self.rope_ring = [0; ROPE_RING];
            self.rope_ring_pos = 0;
        }
        let mut cur = s;
        while (*cur).is_rope() {
            #[cfg(debug_assertions)]
            self.rope_ring_check(cur);
            self.current_source = cur as *mut CellHeader;
            let right = (*cur).right;
            if !right.is_null() {
                if let Some(rope) = self.mark_string_child(right) {
                    self.push_or_delay(MarkStackEntry::TempRope(rope));
                }
            }
            let left = (*cur).left;
            if left.is_null() {
                break;
            }
            match self.mark_string_child(left) {
                Some(next) => cur = next,
                None => break,
            }
        }
    }

    /// Mark one rope child. Returns the child if it is itself a rope whose
    /// spine still needs walking.
    unsafe fn mark_string_child(&mut self, s: *mut JsString) -> Option<*mut JsString> {
        let cell = s as *mut CellHeader;
        if (*cell).is_permanent() {
            return None;
        }
        let region = region_of(cell);
        if (*region).is_nursery() {
            return None;
        }
        let zone = (*region).zone;
        if zone.is_null() {
            return None;
        }
        if (*zone).is_atoms_zone {
            self.note_atom_reference(cell);
        }
        if !(*zone).is_collecting() {
            return None;
        }
        if !(*cell).mark_if_unmarked(self.color) {
            return None;
        }
        self.cells_marked += 1;
        if self.weak_marking {
            self.propagate_weak_entries(cell);
        }
        if (*s).is_rope() {
            Some(s)
        } else {
            None
        }
    }

    /// Shapes are marked eagerly along their parent chain; bases, property
    /// atoms and accessor objects hang off each link.
    unsafe fn walk_shape_chain(&mut self, shape: *mut Shape) {
        let mut cur = shape;
        loop {
            let cell = cur as *mut CellHeader;
            self.current_source = cell;
            if !(*cur).base.is_null() {
                self.mark_cell((*cur).base as *mut CellHeader);
            }
            if !(*cur).prop_atom.is_null() {
                self.mark_cell((*cur).prop_atom as *mut CellHeader);
            }
            if trace_kind_of((*cell).kind()) == TraceKind::AccessorShape {
                let acc = cur as *mut super::cells::AccessorShape;
                if !(*acc).getter.is_null() {
                    self.mark_cell((*acc).getter as *mut CellHeader);
                }
                if !(*acc).setter.is_null() {
                    self.mark_cell((*acc).setter as *mut CellHeader);
                }
            }
            let parent = (*cur).parent;
            if parent.is_null() {
                break;
            }
            let pcell = parent as *mut CellHeader;
            if (*pcell).is_permanent() || !(*zone_of(pcell)).is_collecting() {
                break;
            }
            if !(*pcell).mark_if_unmarked(self.color) {
                break;
            }
            self.cells_marked += 1;
            if self.weak_marking {
                self.propagate_weak_entries(pcell);
            }
            cur = parent;
        }
    }

    unsafe fn walk_scope_chain(&mut self, scope: *mut Scope) {
        let mut cur = scope;
        loop {
            let cell = cur as *mut CellHeader;
            self.current_source = cell;
            for &name in (*cur).name_atoms() {
                if !name.is_null() {
                    self.mark_cell(name as *mut CellHeader);
                }
            }
            let enclosing = (*cur).enclosing;
            if enclosing.is_null() {
                break;
            }
            let ecell = enclosing as *mut CellHeader;
            if (*ecell).is_permanent() || !(*zone_of(ecell)).is_collecting() {
                break;
            }
            if !(*ecell).mark_if_unmarked(self.color) {
                break;
            }
            self.cells_marked += 1;
            if self.weak_marking {
                self.propagate_weak_entries(ecell);
            }
            cur = enclosing;
        }
    }

    unsafe fn push_or_delay(&mut self, entry: MarkStackEntry) {
        if self.stack.len() >= self.max_capacity {
            let cell = match entry {
                MarkStackEntry::Object(o) => o as *mut CellHeader,
                MarkStackEntry::Group(g) => g as *mut CellHeader,
                MarkStackEntry::JitCode(c) => c as *mut CellHeader,
                MarkStackEntry::Script(s) => s as *mut CellHeader,
                MarkStackEntry::TempRope(r) => r as *mut CellHeader,
                MarkStackEntry::ValueArray { obj, .. }
                | MarkStackEntry::SavedValueArray { obj, .. } => obj as *mut CellHeader,
            };
            self.delay_marking_children(cell);
            return;
        }
        self.stack.push(entry);
    }

    unsafe fn delay_marking_children(&mut self, cell: *mut CellHeader) {
        let region = region_of(cell);
        if (*region).flags.contains(RegionFlags::DELAYED_MARKING) {
            return;
        }
        (*region).flags.insert(RegionFlags::DELAYED_MARKING);
        (*region).delayed_link = self.delayed;
        self.delayed = region;
    }

    /// Drain the stack (and the delayed-region list) until empty or the
    /// budget runs out. The budget is consulted after every pop — that is
    /// the only suspension point inside marking.
    pub unsafe fn mark_until_budget_exhausted(&mut self, budget: &mut SliceBudget) -> bool {
        loop {
            while let Some(entry) = self.stack.pop() {
                self.process_entry(entry);
                if budget.step(1) && !self.stack.is_empty() {
                    return false;
                }
            }
            if self.delayed.is_null() {
                return true;
            }
            let region = self.delayed;
            self.delayed = (*region).delayed_link;
            (*region).delayed_link = std::ptr::null_mut();
            (*region).flags.remove(RegionFlags::DELAYED_MARKING);
            for cell in (*region).iter_cells() {
                if (*cell).is_marked_any() {
                    self.current_source = std::ptr::null_mut();
                    self.traverse(cell);
                }
            }
            if budget.step(1) {
                return self.is_drained();
            }
        }
    }

    unsafe fn process_entry(&mut self, entry: MarkStackEntry) {
        match entry {
            MarkStackEntry::Object(obj) => {
                let cell = obj as *mut CellHeader;
                self.current_source = cell;
                if !(*obj).shape.is_null() {
                    self.mark_cell((*obj).shape as *mut CellHeader);
                }
                if !(*obj).group.is_null() {
                    self.mark_cell((*obj).group as *mut CellHeader);
                }
                let inline = (*obj).inline_capacity as usize;
                if inline > 0 {
                    let start = (*obj).inline_slots();
                    self.scan_value_array(obj, start, start.add(inline));
                }
                if !(*obj).dyn_slots.is_null() {
                    let start = (*obj).dyn_slots;
                    self.scan_value_array(obj, start, start.add((*obj).dyn_capacity as usize));
                }
            }
            MarkStackEntry::ValueArray { obj, start, end } => {
                self.scan_value_array(obj, start, end);
            }
            MarkStackEntry::SavedValueArray { obj, index, kind } => {
                self.restore_value_array(obj, index, kind);
            }
            MarkStackEntry::Group(group) => {
                let cell = group as *mut CellHeader;
                self.current_source = cell;
                if !(*group).proto.is_null() {
                    self.mark_cell((*group).proto as *mut CellHeader);
                }
                if !(*group).descriptor.is_null() {
                    self.mark_cell((*group).descriptor as *mut CellHeader);
                }
            }
            MarkStackEntry::Script(script) => {
                let cell = script as *mut CellHeader;
                self.current_source = cell;
                if !(*script).source.is_null() {
                    self.mark_cell((*script).source as *mut CellHeader);
                }
                if !(*script).scope.is_null() {
                    self.mark_cell((*script).scope as *mut CellHeader);
                }
                for &inner in (*script).inner_scripts() {
                    if !inner.is_null() {
                        self.mark_cell(inner as *mut CellHeader);
                    }
                }
            }
            MarkStackEntry::JitCode(code) => {
                self.current_source = code as *mut CellHeader;
                if !(*code).script.is_null() {
                    self.mark_cell((*code).script as *mut CellHeader);
                }
            }
            MarkStackEntry::TempRope(rope) => {
                self.walk_rope(rope);
            }
        }
    }

    /// Scan up to a chunk of slots; push the remainder back for the next
    /// pop. This is what lets a 100k-element array span many slices.
    unsafe fn scan_value_array(&mut self, obj: *mut JsObject, start: *mut Value, end: *mut Value) {
        self.current_source = obj as *mut CellHeader;
        let mut p = start;
        let mut scanned = 0;
        while p < end {
            if scanned == VALUE_ARRAY_CHUNK {
                self.push_or_delay(MarkStackEntry::ValueArray { obj, start: p, end });
                return;
            }
            if let Some(cell) = (*p).as_cell() {
                self.mark_cell(cell);
                self.current_source = obj as *mut CellHeader;
            }
            p = p.add(1);
            scanned += 1;
        }
    }

    unsafe fn restore_value_array(&mut self, obj: *mut JsObject, index: usize, kind: SlotsKind) {
        match kind {
            SlotsKind::Inline => {
                let cap = (*obj).inline_capacity as usize;
                if index <= cap {
                    let start = (*obj).inline_slots();
                    self.scan_value_array(obj, start.add(index), start.add(cap));
                    return;
                }
            }
            SlotsKind::Dynamic => {
                let cap = (*obj).dyn_capacity as usize;
                if !(*obj).dyn_slots.is_null() && index <= cap {
                    let start = (*obj).dyn_slots;
                    self.scan_value_array(obj, start.add(index), start.add(cap));
                    return;
                }
            }
        }
        // The buffer changed shape under us; re-mark the whole object.
        self.push_or_delay(MarkStackEntry::Object(obj));
    }

    /// Convert in-flight pointer-form value arrays to index form. Called at
    /// every slice boundary, before the mutator may reallocate slot buffers.
    pub unsafe fn save_value_arrays(&mut self) {
        for i in 0..self.stack.len() {
            if let MarkStackEntry::ValueArray { obj, start, end: _ } = self.stack[i] {
                let inline_start = (*obj).inline_slots();
                let inline_cap = (*obj).inline_capacity as usize;
                let inline_end = inline_start.add(inline_cap);
                let saved = if start >= inline_start && start <= inline_end {
                    MarkStackEntry::SavedValueArray {
                        obj,
                        index: start.offset_from(inline_start) as usize,
                        kind: SlotsKind::Inline,
                    }
                } else {
                    MarkStackEntry::SavedValueArray {
                        obj,
                        index: start.offset_from((*obj).dyn_slots) as usize,
                        kind: SlotsKind::Dynamic,
                    }
                };
                self.stack[i] = saved;
            }
        }
    }

    /// Switch to weak-marking mode: seed the key table from every weak map
    /// of the collecting zones, propagating immediately for keys that are
    /// already marked.
    pub unsafe fn enter_weak_marking_mode(&mut self, zones: &[*mut Zone]) {
        self.weak_marking = true;
        for &zone in zones {
            let maps: Vec<*mut WeakMap> = (*zone)
                .weak_maps
                .iter_mut()
                .map(|m| &mut **m as *mut WeakMap)
                .collect();
            for map in maps {
                let keys: Vec<usize> = (*map).entries.keys().copied().collect();
                for key in keys {
                    let key_cell = key as *mut CellHeader;
                    if (*key_cell).is_marked_any() {
                        if let Some(value) = (*map).entries.get(&key).copied() {
                            if let Some(cell) = value.as_cell() {
                                self.current_source = key_cell;
                                self.mark_cell(cell);
                            }
                        }
                    } else {
                        self.weak_keys.entry(key).or_default().push(map);
                    }
                }
            }
        }
    }

    pub fn leave_weak_marking_mode(&mut self) {
        self.weak_marking = false;
        self.weak_keys.clear();
    }
}

impl Default for GcMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for GcMarker {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Marking
    }

    fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
        unsafe {
            self.current_source = std::ptr::null_mut();
            self.mark_cell(*slot);
        }
    }

    fn on_value_edge(&mut self, slot: *mut Value, _name: &'static str) {
        unsafe {
            if let Some(cell) = (*slot).as_cell() {
                self.current_source = std::ptr::null_mut();
                self.mark_cell(cell);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::gc::cells::JsObject;
    use crate::gc::driver::{GcReason, SliceBudget};
    use crate::gc::kinds::TraceKind;
    use crate::gc::roots::PersistentRooted;
    use crate::gc::runtime::{GcRuntime, InitialHeap};
    use crate::gc::value::Value;
    use crate::gc::zone::ZoneSpec;
    use crate::GcParams;

    fn wide_container(rt: &mut GcRuntime, children: usize) -> crate::gc::cell::Gc<JsObject> {
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let container = rt
            .allocate_object(compartment, 0, true, InitialHeap::Tenured)
            .unwrap();
        rt.grow_object_slots(container, children).unwrap();
        for i in 0..children {
            let child = rt
                .allocate_object(compartment, 0, true, InitialHeap::Tenured)
                .unwrap();
            JsObject::set_slot(container, i, Value::cell(child.as_cell()));
        }
        container
    }

    /// An overflowing mark stack spills whole regions to the delayed list
    /// and still reaches everything.
    #[test]
    fn delayed_marking_completes_with_a_tiny_stack() {
        let mut rt = GcRuntime::new(GcParams::default());
        let container = wide_container(&mut rt, 2000);
        let root = Box::new(PersistentRooted::new(
            "container",
            Value::cell(container.as_cell()),
        ));
        rt.add_persistent(TraceKind::Object, &root);

        rt.marker.set_max_capacity(8);
        rt.gc(GcReason::DebugGc);

        assert!(rt.marker.is_drained());
        for i in 0..2000 {
            let child = container.slot(i).as_cell().expect("child survives");
            unsafe {
                assert!((*child).is_marked_any(), "child {} unmarked", i);
            }
        }
        rt.remove_persistent(TraceKind::Object, &root);
    }

    /// Value arrays interrupted by the budget convert to index form across
    /// the slice boundary and survive the mutator reallocating the slots.
    #[test]
    fn saved_value_arrays_survive_slot_reallocation() {
        let mut rt = GcRuntime::new(GcParams::default());
        let container = wide_container(&mut rt, 1000);
        let root = Box::new(PersistentRooted::new(
            "container",
            Value::cell(container.as_cell()),
        ));
        rt.add_persistent(TraceKind::Object, &root);

        rt.start_gc(GcReason::DebugGc, SliceBudget::work(5));
        let mut grown = false;
        while rt.is_incremental_gc_in_progress() {
            if !grown && rt.state() == crate::gc::driver::State::Mark {
                // Mutator turn: reallocate the slot buffer under the
                // marker's feet.
                rt.grow_object_slots(container, 1500).unwrap();
                grown = true;
            }
            rt.gc_slice(GcReason::DebugGc, SliceBudget::work(5));
        }
        assert!(grown);
        for i in 0..1000 {
            let child = container.slot(i).as_cell().expect("child survives");
            unsafe {
                assert!((*child).is_marked_any(), "child {} unmarked", i);
            }
        }
        rt.remove_persistent(TraceKind::Object, &root);
    }

    /// Deep left-leaning ropes are marked iteratively on the inline path.
    #[test]
    fn deep_ropes_mark_without_deep_recursion() {
        let mut rt = GcRuntime::new(GcParams::default());
        let compartment = rt.new_compartment(ZoneSpec::System).unwrap();
        let holder = rt
            .allocate_object(compartment, 1, true, InitialHeap::Tenured)
            .unwrap();
        let root = Box::new(PersistentRooted::new(
            "holder",
            Value::cell(holder.as_cell()),
        ));
        rt.add_persistent(TraceKind::Object, &root);

        let mut rope = rt.allocate_string(compartment, "seed").unwrap();
        let mut leaves = Vec::new();
        for i in 0..500 {
            let leaf = rt
                .allocate_string(compartment, &format!("leaf-{}", i))
                .unwrap();
            leaves.push(leaf);
            rope = rt.allocate_rope(compartment, rope, leaf).unwrap();
        }
        JsObject::set_slot(holder, 0, Value::cell(rope.as_cell() as *mut _));
        rt.evict_nursery(GcReason::Api);

        rt.gc(GcReason::DebugGc);

        // Re-read the rope through the holder; strings do not move in a
        // non-compacting collection.
        assert!(rope.header().is_marked_any());
        for leaf in &leaves {
            assert!(leaf.header().is_marked_any(), "rope leaf dropped");
        }
        rt.remove_persistent(TraceKind::Object, &root);
    }
}

/// Gray-unmark recursion of the read barrier: turn `cell` and its gray
/// descendants within the same zone group black, so host code never observes
/// a gray cell.
pub unsafe fn expose_gray_cell_to_black(cell: *mut CellHeader) {
    struct CollectGray {
        group: *mut super::zone::ZoneGroup,
        found: Vec<*mut CellHeader>,
    }

    impl Tracer for CollectGray {
        fn variant(&self) -> TracerVariant {
            TracerVariant::Callback
        }
        fn on_edge(&mut self, slot: *mut *mut CellHeader, _kind: TraceKind, _name: &'static str) {
            unsafe {
                let target = *slot;
                if (*target).is_marked_gray() && (*region_of(target)).group == self.group {
                    self.found.push(target);
                }
            }
        }
    }

    let group = (*region_of(cell)).group;
    let mut worklist = vec![cell];
    while let Some(c) = worklist.pop() {
        if !(*c).is_marked_gray() {
            continue;
        }
        (*c).mark_if_unmarked(CellColor::Black);
        let mut collect = CollectGray {
            group,
            found: Vec::new(),
        };
        trace_children(c, &mut collect);
        worklist.extend(collect.found);
    }
}

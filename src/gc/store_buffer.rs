//! The store buffer: a deduplicated remembered set of tenured→nursery edges,
//! consumed as the root set of minor GC.
//!
//! Four entry flavors: plain cell slots, tagged-value slots, whole cells
//! (cheaper than buffering a cell's many slots one by one), and generic
//! refs for embedder structures that know how to re-present their own edges.
//! Entries are keyed by slot address, so re-writing the same slot a thousand
//! times costs one entry.

use hashbrown::HashSet;

use super::cell::CellHeader;
use super::tracer::{trace_children, trace_kind_for, Tracer};
use super::value::Value;

/// An embedder-provided remembered-set entry. One entry may stand for many
/// edges (e.g. every key of a hash table).
pub trait BufferableRef {
    fn trace(&self, trc: &mut dyn Tracer);
}

/// Per-flavor entry limit; crossing it requests an immediate minor GC.
const OVERFLOW_LIMIT: usize = 8 * 1024;

pub struct StoreBuffer {
    cell_edges: HashSet<usize>,
    value_edges: HashSet<usize>,
    whole_cells: HashSet<usize>,
    generics: Vec<Box<dyn BufferableRef>>,
    enabled: bool,
    about_to_overflow: bool,
}

impl StoreBuffer {
    pub fn new() -> StoreBuffer {
        StoreBuffer {
            cell_edges: HashSet::new(),
            value_edges: HashSet::new(),
            whole_cells: HashSet::new(),
            generics: Vec::new(),
            enabled: true,
            about_to_overflow: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    fn note_size(&mut self, len: usize) {
        if len > OVERFLOW_LIMIT {
            self.about_to_overflow = true;
        }
    }

    pub fn put_cell_edge(&mut self, slot: *mut *mut CellHeader) {
        if !self.enabled {
            return;
        }
        self.cell_edges.insert(slot as usize);
        let len = self.cell_edges.len();
        self.note_size(len);
    }

    pub fn put_value_edge(&mut self, slot: *mut Value) {
        if !self.enabled {
            return;
        }
        self.value_edges.insert(slot as usize);
        let len = self.value_edges.len();
        self.note_size(len);
    }

    /// Remember a whole cell instead of its individual slots.
    pub fn put_whole_cell(&mut self, cell: *mut CellHeader) {
        if !self.enabled {
            return;
        }
        self.whole_cells.insert(cell as usize);
        let len = self.whole_cells.len();
        self.note_size(len);
    }

    pub fn put_generic(&mut self, entry: Box<dyn BufferableRef>) {
        if !self.enabled {
            return;
        }
        self.generics.push(entry);
        let len = self.generics.len();
        self.note_size(len);
    }

    /// Entry-count overflow requests a minor GC; the allocator consults this
    /// at its next safepoint.
    pub fn wants_minor_gc(&self) -> bool {
        self.about_to_overflow
    }

    pub fn is_empty(&self) -> bool {
        self.cell_edges.is_empty()
            && self.value_edges.is_empty()
            && self.whole_cells.is_empty()
            && self.generics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cell_edges.len() + self.value_edges.len() + self.whole_cells.len()
            + self.generics.len()
    }

    pub fn contains_cell_edge(&self, slot: *const *mut CellHeader) -> bool {
        self.cell_edges.contains(&(slot as usize))
    }

    pub fn contains_value_edge(&self, slot: *const Value) -> bool {
        self.value_edges.contains(&(slot as usize))
    }

    pub fn contains_whole_cell(&self, cell: *const CellHeader) -> bool {
        self.whole_cells.contains(&(cell as usize))
    }

    /// Present every remembered edge to the tenuring tracer, then forget
    /// everything. The nursery is empty when this returns to its caller.
    pub unsafe fn trace_edges(&mut self, trc: &mut dyn Tracer) {
        for &slot in &self.cell_edges {
            let slot = slot as *mut *mut CellHeader;
            if (*slot).is_null() {
                continue;
            }
            let kind = trace_kind_for(*slot);
            trc.on_edge(slot, kind, "store-buffer-slot");
        }
        for &slot in &self.value_edges {
            trc.on_value_edge(slot as *mut Value, "store-buffer-value");
        }
        for &cell in &self.whole_cells {
            trace_children(cell as *mut CellHeader, trc);
        }
        let generics = std::mem::take(&mut self.generics);
        for entry in &generics {
            entry.trace(trc);
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.cell_edges.clear();
        self.value_edges.clear();
        self.whole_cells.clear();
        self.generics.clear();
        self.about_to_overflow = false;
    }
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}

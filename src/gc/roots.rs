//! The root set: persistent roots, embedder callback tracers, and the glue
//! that presents them (plus the shadow stack) to a tracer in one pass.
//!
//! Persistent roots are intrusive list nodes keyed by trace kind, owned by
//! the embedding; registering never allocates and unregistering is O(1).
//! Stack roots live on the shadow stack (see `shadowstack.rs`). Embedder
//! tracers come in a black list and a single gray hook — the gray one feeds
//! the cycle collector's view.

use std::cell::Cell;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};

use super::kinds::{TraceKind, TRACE_KIND_COUNT};
use super::tracer::Tracer;
use super::value::Value;

/// A long-lived root slot. Embedder-owned; must not move (keep it boxed or
/// pinned) while registered.
pub struct PersistentRooted {
    link: LinkedListLink,
    value: Cell<Value>,
    name: &'static str,
}

impl PersistentRooted {
    pub fn new(name: &'static str, value: Value) -> PersistentRooted {
        PersistentRooted {
            link: LinkedListLink::new(),
            value: Cell::new(value),
            name,
        }
    }

    pub fn get(&self) -> Value {
        self.value.get()
    }

    pub fn set(&self, value: Value) {
        self.value.set(value);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn slot_ptr(&self) -> *mut Value {
        self.value.as_ptr()
    }
}

intrusive_adapter!(pub PersistentAdapter = UnsafeRef<PersistentRooted>: PersistentRooted { link: LinkedListLink });

/// Host-supplied root tracing callback.
pub type TraceOp = fn(&mut dyn Tracer, *mut u8);

pub struct RootLists {
    persistent: [LinkedList<PersistentAdapter>; TRACE_KIND_COUNT],
    black_tracers: Vec<(TraceOp, *mut u8)>,
    gray_tracer: Option<(TraceOp, *mut u8)>,
}

impl RootLists {
    pub fn new() -> RootLists {
        RootLists {
            persistent: std::array::from_fn(|_| LinkedList::new(PersistentAdapter::new())),
            black_tracers: Vec::new(),
            gray_tracer: None,
        }
    }

    /// Register a persistent root. The slot is visited on every root trace,
    /// in registration order, until removed.
    ///
    /// # Safety
    /// `root` must outlive its registration and must not move.
    pub unsafe fn add_persistent(&mut self, kind: TraceKind, root: &PersistentRooted) {
        debug_assert!(!root.link.is_linked());
        self.persistent[kind as usize].push_back(UnsafeRef::from_raw(root as *const _));
    }

    /// # Safety
    /// `root` must currently be registered under `kind`.
    pub unsafe fn remove_persistent(&mut self, kind: TraceKind, root: &PersistentRooted) {
        let mut cursor = self.persistent[kind as usize]
            .cursor_mut_from_ptr(root as *const PersistentRooted);
        cursor.remove();
    }

    pub fn add_black_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.black_tracers.push((op, data));
    }

    pub fn remove_black_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.black_tracers
            .retain(|&(o, d)| !(o == op && d == data));
    }

    pub fn set_gray_tracer(&mut self, op: TraceOp, data: *mut u8) {
        self.gray_tracer = Some((op, data));
    }

    pub fn clear_gray_tracer(&mut self) {
        self.gray_tracer = None;
    }

    /// Present every black root exactly once, in registration order.
    pub fn trace_black_roots(&mut self, trc: &mut dyn Tracer) {
        for list in self.persistent.iter() {
            for root in list.iter() {
                trc.on_value_edge(root.slot_ptr(), root.name());
            }
        }
        let tracers = std::mem::take(&mut self.black_tracers);
        for &(op, data) in &tracers {
            op(trc, data);
        }
        self.black_tracers = tracers;
    }

    pub fn trace_gray_roots(&mut self, trc: &mut dyn Tracer) {
        if let Some((op, data)) = self.gray_tracer {
            op(trc, data);
        }
    }

    pub fn persistent_count(&self) -> usize {
        self.persistent.iter().map(|l| l.iter().count()).sum()
    }
}

impl Default for RootLists {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::CellHeader;
    use crate::gc::tracer::TracerVariant;

    struct Collector {
        seen: Vec<*mut CellHeader>,
    }

    impl Tracer for Collector {
        fn variant(&self) -> TracerVariant {
            TracerVariant::Callback
        }
        fn on_edge(&mut self, slot: *mut *mut CellHeader, _: TraceKind, _: &'static str) {
            unsafe { self.seen.push(*slot) }
        }
        fn on_value_edge(&mut self, slot: *mut Value, _: &'static str) {
            unsafe {
                if let Some(cell) = (*slot).as_cell() {
                    self.seen.push(cell);
                }
            }
        }
    }

    #[test]
    fn persistent_roots_trace_in_registration_order() {
        let mut roots = RootLists::new();
        let a = Box::new(PersistentRooted::new(
            "a",
            Value::cell(0x10_0010 as *mut CellHeader),
        ));
        let b = Box::new(PersistentRooted::new(
            "b",
            Value::cell(0x10_0020 as *mut CellHeader),
        ));
        unsafe {
            roots.add_persistent(TraceKind::Object, &a);
            roots.add_persistent(TraceKind::Object, &b);
        }
        let mut trc = Collector { seen: Vec::new() };
        roots.trace_black_roots(&mut trc);
        assert_eq!(
            trc.seen,
            vec![0x10_0010 as *mut CellHeader, 0x10_0020 as *mut CellHeader]
        );
        unsafe {
            roots.remove_persistent(TraceKind::Object, &a);
        }
        let mut trc = Collector { seen: Vec::new() };
        roots.trace_black_roots(&mut trc);
        assert_eq!(trc.seen, vec![0x10_0020 as *mut CellHeader]);
        unsafe {
            roots.remove_persistent(TraceKind::Object, &b);
        }
        assert_eq!(roots.persistent_count(), 0);
    }

    #[test]
    fn black_tracers_run_with_their_data() {
        fn tracer_op(trc: &mut dyn Tracer, data: *mut u8) {
            let mut value = Value::cell(data as *mut CellHeader);
            trc.on_value_edge(&mut value as *mut Value, "embedder");
        }
        let mut roots = RootLists::new();
        roots.add_black_tracer(tracer_op, 0x20_0010usize as *mut u8);
        let mut trc = Collector { seen: Vec::new() };
        roots.trace_black_roots(&mut trc);
        assert_eq!(trc.seen, vec![0x20_0010usize as *mut CellHeader]);
        roots.remove_black_tracer(tracer_op, 0x20_0010usize as *mut u8);
        let mut trc = Collector { seen: Vec::new() };
        roots.trace_black_roots(&mut trc);
        assert!(trc.seen.is_empty());
    }
}

//! Edge visitors.
//!
//! One `Tracer` trait serves every traversal the collector performs: the
//! marker (black/gray/weak), the tenuring pass of minor GC, the pointer
//! update pass of compaction, and host callback tracing. `trace_children`
//! emits every owned edge of a cell exactly once, identically for every
//! variant; what happens at an edge is the visitor's business.
//!
//! Dispatch is a match on the kind tag — per-trace-kind free functions, no
//! vtables in cells.

use super::cell::{maybe_forwarded, CellHeader};
use super::cells::{
    AccessorShape, BaseShape, JitCode, JsObject, JsString, LazyScript, ObjectGroup, RegExpShared,
    Scope, Script, Symbol,
};
use super::kinds::{trace_kind_of, TraceKind};
use super::value::Value;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TracerVariant {
    /// The GC marker, including its weak-marking mode.
    Marking,
    /// Minor-GC promotion; rewrites slots to tenured copies.
    Tenuring,
    /// Compaction pointer update; rewrites slots through forwarding overlays.
    Moving,
    /// Host-visible callback traversal. Never mutates slots.
    Callback,
}

pub trait Tracer {
    fn variant(&self) -> TracerVariant;

    /// Visit one cell edge. `slot` holds a non-null cell pointer; the tracer
    /// may overwrite it (tenuring, moving).
    fn on_edge(&mut self, slot: *mut *mut CellHeader, kind: TraceKind, name: &'static str);

    /// Visit one tagged-value edge. The default unwraps cell values and
    /// forwards to `on_edge`, writing back any update.
    fn on_value_edge(&mut self, slot: *mut Value, name: &'static str) {
        unsafe {
            if let Some(cell) = (*slot).as_cell() {
                let mut tmp = cell;
                let kind = trace_kind_for(cell);
                self.on_edge(&mut tmp as *mut *mut CellHeader, kind, name);
                if tmp != cell {
                    *slot = Value::cell(tmp);
                }
            }
        }
    }
}

/// Trace kind of a possibly-forwarded cell.
#[inline]
pub unsafe fn trace_kind_for(cell: *mut CellHeader) -> TraceKind {
    trace_kind_of((*maybe_forwarded(cell)).kind())
}

/// Emit a typed cell field as an edge if it is non-null.
#[inline]
pub unsafe fn trace_field<T>(
    trc: &mut dyn Tracer,
    field: *mut *mut T,
    kind: TraceKind,
    name: &'static str,
) {
    if !(*field).is_null() {
        trc.on_edge(field as *mut *mut CellHeader, kind, name);
    }
}

/// Walk every owned edge of `cell`. Uniform across tracer variants.
pub unsafe fn trace_children(cell: *mut CellHeader, trc: &mut dyn Tracer) {
    match trace_kind_of((*cell).kind()) {
        TraceKind::Object => trace_object(cell as *mut JsObject, trc),
        TraceKind::Script => trace_script(cell as *mut Script, trc),
        TraceKind::LazyScript => trace_lazy_script(cell as *mut LazyScript, trc),
        TraceKind::Shape => trace_shape(cell as *mut Shape, trc),
        TraceKind::AccessorShape => trace_accessor_shape(cell as *mut AccessorShape, trc),
        TraceKind::BaseShape => trace_base_shape(cell as *mut BaseShape, trc),
        TraceKind::ObjectGroup => trace_object_group(cell as *mut ObjectGroup, trc),
        TraceKind::String | TraceKind::Atom => trace_string(cell as *mut JsString, trc),
        TraceKind::ExternalString => {
            // External character data is not a GC edge.
        }
        TraceKind::Symbol => trace_symbol(cell as *mut Symbol, trc),
        TraceKind::JitCode => trace_jit_code(cell as *mut JitCode, trc),
        TraceKind::Scope => trace_scope(cell as *mut Scope, trc),
        TraceKind::RegExpShared => trace_regexp_shared(cell as *mut RegExpShared, trc),
    }
}

use super::cells::Shape;

pub(crate) unsafe fn trace_object(obj: *mut JsObject, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*obj).shape, TraceKind::Shape, "shape");
    trace_field(trc, &mut (*obj).group, TraceKind::ObjectGroup, "group");
    let count = (*obj).slot_count();
    for i in 0..count {
        trc.on_value_edge((*obj).slot_ptr(i), "slot");
    }
}

unsafe fn trace_script(script: *mut Script, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*script).source, TraceKind::Atom, "source");
    trace_field(trc, &mut (*script).scope, TraceKind::Scope, "scope");
    let len = (*script).inner_len as usize;
    for i in 0..len {
        trace_field(
            trc,
            (*script).inner.add(i),
            TraceKind::Script,
            "inner-script",
        );
    }
}

unsafe fn trace_lazy_script(lazy: *mut LazyScript, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*lazy).script, TraceKind::Script, "script");
    trace_field(trc, &mut (*lazy).scope, TraceKind::Scope, "enclosing-scope");
    trace_field(trc, &mut (*lazy).source, TraceKind::Atom, "source");
}

unsafe fn trace_shape(shape: *mut Shape, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*shape).base, TraceKind::BaseShape, "base");
    trace_field(trc, &mut (*shape).parent, TraceKind::Shape, "parent");
    trace_field(trc, &mut (*shape).prop_atom, TraceKind::Atom, "name");
}

unsafe fn trace_accessor_shape(shape: *mut AccessorShape, trc: &mut dyn Tracer) {
    trace_shape(&mut (*shape).shape, trc);
    trace_field(trc, &mut (*shape).getter, TraceKind::Object, "getter");
    trace_field(trc, &mut (*shape).setter, TraceKind::Object, "setter");
}

unsafe fn trace_base_shape(base: *mut BaseShape, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*base).proto, TraceKind::Object, "proto");
}

unsafe fn trace_object_group(group: *mut ObjectGroup, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*group).proto, TraceKind::Object, "proto");
    trace_field(
        trc,
        &mut (*group).descriptor,
        TraceKind::ObjectGroup,
        "descriptor",
    );
}

unsafe fn trace_string(s: *mut JsString, trc: &mut dyn Tracer) {
    if (*s).is_rope() {
        trace_field(trc, &mut (*s).left, TraceKind::String, "left-child");
        trace_field(trc, &mut (*s).right, TraceKind::String, "right-child");
    }
}

unsafe fn trace_symbol(sym: *mut Symbol, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*sym).description, TraceKind::Atom, "description");
}

unsafe fn trace_jit_code(code: *mut JitCode, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*code).script, TraceKind::Script, "script");
}

unsafe fn trace_scope(scope: *mut Scope, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*scope).enclosing, TraceKind::Scope, "enclosing");
    let len = (*scope).name_count as usize;
    for i in 0..len {
        trace_field(trc, (*scope).names.add(i), TraceKind::Atom, "name");
    }
}

unsafe fn trace_regexp_shared(re: *mut RegExpShared, trc: &mut dyn Tracer) {
    trace_field(trc, &mut (*re).source, TraceKind::Atom, "source");
}

/// A tracer that calls a host closure for every edge without mutating
/// anything. This is what embedder callbacks and heap verification see.
pub struct CallbackTracer<'a> {
    pub callback: &'a mut dyn FnMut(*mut CellHeader, TraceKind, &'static str),
}

impl<'a> Tracer for CallbackTracer<'a> {
    fn variant(&self) -> TracerVariant {
        TracerVariant::Callback
    }

    fn on_edge(&mut self, slot: *mut *mut CellHeader, kind: TraceKind, name: &'static str) {
        unsafe {
            (self.callback)(*slot, kind, name);
        }
    }
}

/// Things that can appear in roots and know how to present their edges.
///
/// # Safety
/// Implementations must visit every contained GC edge; missing one lets the
/// collector free a reachable cell.
pub unsafe trait Trace {
    fn trace(&mut self, trc: &mut dyn Tracer);
}

unsafe impl Trace for Value {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        trc.on_value_edge(self as *mut Value, "root-value");
    }
}

unsafe impl<T> Trace for super::cell::Gc<T> {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        unsafe {
            let slot = self as *mut Self as *mut *mut CellHeader;
            let kind = trace_kind_for(*slot);
            trc.on_edge(slot, kind, "root");
        }
    }
}

unsafe impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        if let Some(v) = self {
            v.trace(trc);
        }
    }
}

unsafe impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        for v in self.iter_mut() {
            v.trace(trc);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        for v in self.iter_mut() {
            v.trace(trc);
        }
    }
}

unsafe impl<A: Trace, B: Trace> Trace for (A, B) {
    fn trace(&mut self, trc: &mut dyn Tracer) {
        self.0.trace(trc);
        self.1.trace(trc);
    }
}

//! Allocation kinds and their static metadata.
//!
//! The heap holds a closed set of 27 kinds. Everything the collector needs
//! to know about a kind — byte size, whether it may live in the nursery,
//! which finalization discipline applies, how to trace it — is a row in one
//! static table, so no cell carries a vtable and no hot path does dynamic
//! dispatch.

use std::mem::size_of;

use super::cell::CELL_ALIGN;
use super::cells::{
    AccessorShape, BaseShape, InlineString, JitCode, JsObject, JsString, LazyScript, ObjectGroup,
    RegExpShared, Scope, Script, Shape, Symbol,
};
use super::round_up;
use super::value::Value;

/// Every kind of cell the heap can hold. Object kinds come in six inline
/// slot classes, each in a plain (foreground-finalized) and a background
/// (thread-safe finalizer) variant.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum AllocKind {
    Object0 = 0,
    Object0Background,
    Object2,
    Object2Background,
    Object4,
    Object4Background,
    Object8,
    Object8Background,
    Object12,
    Object12Background,
    Object16,
    Object16Background,
    Script,
    LazyScript,
    Shape,
    AccessorShape,
    BaseShape,
    ObjectGroup,
    InlineString,
    String,
    ExternalString,
    InlineAtom,
    Atom,
    Symbol,
    JitCode,
    Scope,
    RegExpShared,
}

pub const ALLOC_KIND_COUNT: usize = 27;

impl AllocKind {
    pub const ALL: [AllocKind; ALLOC_KIND_COUNT] = [
        AllocKind::Object0,
        AllocKind::Object0Background,
        AllocKind::Object2,
        AllocKind::Object2Background,
        AllocKind::Object4,
        AllocKind::Object4Background,
        AllocKind::Object8,
        AllocKind::Object8Background,
        AllocKind::Object12,
        AllocKind::Object12Background,
        AllocKind::Object16,
        AllocKind::Object16Background,
        AllocKind::Script,
        AllocKind::LazyScript,
        AllocKind::Shape,
        AllocKind::AccessorShape,
        AllocKind::BaseShape,
        AllocKind::ObjectGroup,
        AllocKind::InlineString,
        AllocKind::String,
        AllocKind::ExternalString,
        AllocKind::InlineAtom,
        AllocKind::Atom,
        AllocKind::Symbol,
        AllocKind::JitCode,
        AllocKind::Scope,
        AllocKind::RegExpShared,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> AllocKind {
        debug_assert!(index < ALLOC_KIND_COUNT);
        Self::ALL[index]
    }

    pub fn is_object(self) -> bool {
        (self as usize) <= AllocKind::Object16Background as usize
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            AllocKind::InlineString
                | AllocKind::String
                | AllocKind::ExternalString
                | AllocKind::InlineAtom
                | AllocKind::Atom
        )
    }

    pub fn is_atom(self) -> bool {
        matches!(self, AllocKind::InlineAtom | AllocKind::Atom)
    }
}

/// How `trace_children` walks a cell. One entry per distinct layout.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum TraceKind {
    Object,
    Script,
    LazyScript,
    Shape,
    AccessorShape,
    BaseShape,
    ObjectGroup,
    String,
    ExternalString,
    Atom,
    Symbol,
    JitCode,
    Scope,
    RegExpShared,
}

pub const TRACE_KIND_COUNT: usize = 14;

/// Static per-kind metadata row.
pub struct KindInfo {
    /// Fixed cell size in bytes, 16-aligned.
    pub size: usize,
    /// May the allocator place cells of this kind in the nursery?
    pub nursery_allocable: bool,
    /// Is the finalizer safe to run off-thread?
    pub background_finalizable: bool,
    /// Does the cycle collector care about this kind?
    pub participates_in_cc: bool,
    pub trace_kind: TraceKind,
    /// May compaction pick regions of this kind as relocation sources?
    /// Atoms stay put so their bitmap indices remain valid; jit code and
    /// external strings are pinned by the embedding.
    pub compactable: bool,
}

const fn sized<T>() -> usize {
    round_up(size_of::<T>(), CELL_ALIGN)
}

const fn object_size(inline_slots: usize) -> usize {
    round_up(
        size_of::<JsObject>() + inline_slots * size_of::<Value>(),
        CELL_ALIGN,
    )
}

const fn object_kind_info(inline_slots: usize, background: bool) -> KindInfo {
    KindInfo {
        size: object_size(inline_slots),
        // Only objects with thread-safe finalizers may start life in the
        // nursery; a foreground finalizer pins the cell to the tenured heap.
        nursery_allocable: background,
        background_finalizable: background,
        participates_in_cc: true,
        trace_kind: TraceKind::Object,
        compactable: true,
    }
}

const fn kind_info(
    size: usize,
    background_finalizable: bool,
    participates_in_cc: bool,
    trace_kind: TraceKind,
    compactable: bool,
) -> KindInfo {
    KindInfo {
        size,
        nursery_allocable: false,
        background_finalizable,
        participates_in_cc,
        trace_kind,
        compactable,
    }
}

pub static KIND_INFO: [KindInfo; ALLOC_KIND_COUNT] = [
    object_kind_info(0, false),
    object_kind_info(0, true),
    object_kind_info(2, false),
    object_kind_info(2, true),
    object_kind_info(4, false),
    object_kind_info(4, true),
    object_kind_info(8, false),
    object_kind_info(8, true),
    object_kind_info(12, false),
    object_kind_info(12, true),
    object_kind_info(16, false),
    object_kind_info(16, true),
    kind_info(sized::<Script>(), false, true, TraceKind::Script, true),
    kind_info(sized::<LazyScript>(), true, true, TraceKind::LazyScript, true),
    kind_info(sized::<Shape>(), true, false, TraceKind::Shape, true),
    kind_info(
        sized::<AccessorShape>(),
        true,
        false,
        TraceKind::AccessorShape,
        true,
    ),
    kind_info(sized::<BaseShape>(), true, false, TraceKind::BaseShape, true),
    kind_info(
        sized::<ObjectGroup>(),
        true,
        false,
        TraceKind::ObjectGroup,
        true,
    ),
    kind_info(sized::<InlineString>(), true, false, TraceKind::String, true),
    kind_info(sized::<JsString>(), true, false, TraceKind::String, true),
    kind_info(
        sized::<JsString>(),
        false,
        false,
        TraceKind::ExternalString,
        false,
    ),
    kind_info(sized::<InlineString>(), true, false, TraceKind::Atom, false),
    kind_info(sized::<JsString>(), true, false, TraceKind::Atom, false),
    kind_info(sized::<Symbol>(), true, false, TraceKind::Symbol, false),
    kind_info(sized::<JitCode>(), false, true, TraceKind::JitCode, false),
    kind_info(sized::<Scope>(), true, false, TraceKind::Scope, true),
    kind_info(
        sized::<RegExpShared>(),
        true,
        false,
        TraceKind::RegExpShared,
        true,
    ),
];

#[inline(always)]
pub fn info(kind: AllocKind) -> &'static KindInfo {
    &KIND_INFO[kind.index()]
}

#[inline(always)]
pub fn size_of_kind(kind: AllocKind) -> usize {
    info(kind).size
}

#[inline(always)]
pub fn is_nursery_allocable(kind: AllocKind) -> bool {
    info(kind).nursery_allocable
}

#[inline(always)]
pub fn is_background_finalizable(kind: AllocKind) -> bool {
    info(kind).background_finalizable
}

#[inline(always)]
pub fn trace_kind_of(kind: AllocKind) -> TraceKind {
    info(kind).trace_kind
}

#[inline(always)]
pub fn is_compactable(kind: AllocKind) -> bool {
    info(kind).compactable
}

/// Number of inline slots baked into an object kind's cell.
pub fn object_slot_count(kind: AllocKind) -> usize {
    debug_assert!(kind.is_object());
    const SLOTS: [usize; 12] = [0, 0, 2, 2, 4, 4, 8, 8, 12, 12, 16, 16];
    SLOTS[kind.index()]
}

/// Pick the best object kind for the requested slot count. Requests past the
/// largest class get the largest class; the overflow lives in dynamic slots.
pub fn object_kind_for_slots(nslots: usize, background: bool) -> AllocKind {
    let plain = match nslots {
        0 => AllocKind::Object0,
        1..=2 => AllocKind::Object2,
        3..=4 => AllocKind::Object4,
        5..=8 => AllocKind::Object8,
        9..=12 => AllocKind::Object12,
        _ => AllocKind::Object16,
    };
    if background {
        AllocKind::from_index(plain.index() + 1)
    } else {
        plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent() {
        for kind in AllocKind::ALL {
            let info = info(kind);
            assert!(info.size >= CELL_ALIGN, "{:?} too small", kind);
            assert_eq!(info.size % CELL_ALIGN, 0, "{:?} misaligned", kind);
            if info.nursery_allocable {
                // I4 by construction: nothing that must stay put may start
                // in the nursery.
                assert!(kind.is_object(), "{:?} nursery allocable", kind);
            }
        }
    }

    #[test]
    fn object_kind_selection() {
        assert_eq!(object_kind_for_slots(0, false), AllocKind::Object0);
        assert_eq!(object_kind_for_slots(1, false), AllocKind::Object2);
        assert_eq!(object_kind_for_slots(4, true), AllocKind::Object4Background);
        assert_eq!(object_kind_for_slots(9, false), AllocKind::Object12);
        assert_eq!(
            object_kind_for_slots(40, true),
            AllocKind::Object16Background
        );
    }

    #[test]
    fn object_sizes_grow_with_slots() {
        let s0 = size_of_kind(AllocKind::Object0);
        let s8 = size_of_kind(AllocKind::Object8);
        let s16 = size_of_kind(AllocKind::Object16);
        assert!(s0 < s8 && s8 < s16);
        assert_eq!(
            size_of_kind(AllocKind::Object8),
            size_of_kind(AllocKind::Object8Background)
        );
    }

    #[test]
    fn atoms_are_not_compactable() {
        assert!(!is_compactable(AllocKind::Atom));
        assert!(!is_compactable(AllocKind::InlineAtom));
        assert!(is_compactable(AllocKind::Object4));
        assert!(is_compactable(AllocKind::Shape));
    }
}

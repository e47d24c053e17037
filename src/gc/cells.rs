//! Cell payload layouts.
//!
//! These are the runtime's GC things reduced to what the collector has to
//! understand: which fields are edges, which own malloc'd side data, and how
//! big each cell is. Every struct is `#[repr(C)]` with the header first so a
//! `*mut CellHeader` and a payload pointer are the same address.
//!
//! Cells move (promotion, compaction) by raw byte copy, so payloads never
//! hold interior pointers into themselves; the inline storage of objects and
//! inline strings is reached by offset from `self`.

use std::ptr::null_mut;

use super::barrier::{post_write_barrier_value, pre_write_barrier_value};
use super::cell::{CellHeader, Gc};
use super::kinds::{object_slot_count, AllocKind};
use super::value::Value;

pub const OBJ_FLAG_WRAPPER: u32 = 1 << 0;

/// Inline character capacity of the fat inline string/atom kinds.
pub const INLINE_STRING_CAPACITY: usize = 32;

#[repr(C)]
pub struct JsObject {
    pub(crate) header: CellHeader,
    pub(crate) shape: *mut Shape,
    pub(crate) group: *mut ObjectGroup,
    pub(crate) flags: u32,
    pub(crate) inline_capacity: u32,
    /// Overflow slots past the inline capacity, or null. Owned; freed by the
    /// finalizer (or by the nursery's malloced-buffer sweep for cells that
    /// die young).
    pub(crate) dyn_slots: *mut Value,
    pub(crate) dyn_capacity: u32,
    pub(crate) _pad: u32,
    // `inline_capacity` slots of `Value` follow.
}

impl JsObject {
    pub(crate) unsafe fn init(
        obj: *mut JsObject,
        kind: AllocKind,
        shape: *mut Shape,
        group: *mut ObjectGroup,
    ) {
        let inline = object_slot_count(kind);
        (*obj).shape = shape;
        (*obj).group = group;
        (*obj).flags = 0;
        (*obj).inline_capacity = inline as u32;
        (*obj).dyn_slots = null_mut();
        (*obj).dyn_capacity = 0;
        (*obj)._pad = 0;
        let slots = (*obj).inline_slots();
        for i in 0..inline {
            slots.add(i).write(Value::undefined());
        }
    }

    #[inline(always)]
    pub(crate) fn inline_slots(&self) -> *mut Value {
        unsafe {
            (self as *const JsObject as *mut u8).add(std::mem::size_of::<JsObject>()) as *mut Value
        }
    }

    pub fn slot_count(&self) -> usize {
        self.inline_capacity as usize + self.dyn_capacity as usize
    }

    #[inline]
    pub(crate) fn slot_ptr(&self, index: usize) -> *mut Value {
        let inline = self.inline_capacity as usize;
        if index < inline {
            unsafe { self.inline_slots().add(index) }
        } else {
            debug_assert!(index - inline < self.dyn_capacity as usize);
            unsafe { self.dyn_slots.add(index - inline) }
        }
    }

    pub fn slot(&self, index: usize) -> Value {
        unsafe { *self.slot_ptr(index) }
    }

    /// Barriered slot write: pre-barrier the old value, store, post-barrier
    /// the new one. Every mutator-visible write goes through here.
    pub fn set_slot(this: Gc<JsObject>, index: usize, value: Value) {
        unsafe {
            let slot = this.slot_ptr(index);
            pre_write_barrier_value(*slot);
            *slot = value;
            post_write_barrier_value(this.as_cell(), slot, value);
        }
    }

    /// Unbarriered store for freshly allocated objects.
    pub fn init_slot(this: Gc<JsObject>, index: usize, value: Value) {
        unsafe {
            *this.slot_ptr(index) = value;
            // A fresh tenured object may still point at the nursery.
            post_write_barrier_value(this.as_cell(), this.slot_ptr(index), value);
        }
    }

    pub fn is_wrapper(&self) -> bool {
        self.flags & OBJ_FLAG_WRAPPER != 0
    }

    /// Cross-compartment wrappers keep their target in slot 0.
    pub fn wrapper_target(&self) -> Option<*mut CellHeader> {
        debug_assert!(self.is_wrapper());
        self.slot(0).as_cell()
    }
}

pub const STR_FLAG_ROPE: u32 = 1 << 0;
pub const STR_FLAG_INLINE: u32 = 1 << 1;
pub const STR_FLAG_EXTERNAL: u32 = 1 << 2;
pub const STR_FLAG_ATOM: u32 = 1 << 3;

#[repr(C)]
pub struct JsString {
    pub(crate) header: CellHeader,
    pub(crate) flags: u32,
    pub(crate) len: u32,
    /// Rope children; null for linear strings.
    pub(crate) left: *mut JsString,
    pub(crate) right: *mut JsString,
    /// Character storage for linear non-inline strings. Owned unless
    /// external.
    pub(crate) data: *mut u8,
    /// External strings are released through this hook instead of the heap.
    pub(crate) external_free: Option<unsafe fn(*mut u8, usize)>,
}

impl JsString {
    pub fn is_rope(&self) -> bool {
        self.flags & STR_FLAG_ROPE != 0
    }

    pub fn is_inline(&self) -> bool {
        self.flags & STR_FLAG_INLINE != 0
    }

    pub fn is_external(&self) -> bool {
        self.flags & STR_FLAG_EXTERNAL != 0
    }

    pub fn is_atom(&self) -> bool {
        self.flags & STR_FLAG_ATOM != 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Character pointer for linear strings. Inline storage is addressed
    /// relative to `self` so it survives a raw-copy move.
    pub fn chars(&self) -> *const u8 {
        debug_assert!(!self.is_rope());
        if self.is_inline() {
            unsafe {
                (self as *const JsString as *const u8).add(std::mem::size_of::<JsString>())
            }
        } else {
            self.data
        }
    }

    pub fn as_str(&self) -> &str {
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.chars(), self.len()))
        }
    }

    pub(crate) unsafe fn init_linear(s: *mut JsString, text: &str, inline: bool, atom: bool) {
        (*s).len = text.len() as u32;
        (*s).left = null_mut();
        (*s).right = null_mut();
        (*s).external_free = None;
        let mut flags = 0;
        if atom {
            flags |= STR_FLAG_ATOM;
        }
        if inline {
            debug_assert!(text.len() <= INLINE_STRING_CAPACITY);
            flags |= STR_FLAG_INLINE;
            (*s).data = null_mut();
            (*s).flags = flags;
            let dst = (s as *mut u8).add(std::mem::size_of::<JsString>());
            std::ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
        } else {
            let buf: Box<[u8]> = text.as_bytes().into();
            (*s).data = Box::into_raw(buf) as *mut u8;
            (*s).flags = flags;
        }
    }

    pub(crate) unsafe fn init_rope(s: *mut JsString, left: *mut JsString, right: *mut JsString) {
        (*s).flags = STR_FLAG_ROPE;
        (*s).len = (*left).len + (*right).len;
        (*s).left = left;
        (*s).right = right;
        (*s).data = null_mut();
        (*s).external_free = None;
    }

    pub(crate) unsafe fn init_external(
        s: *mut JsString,
        data: *mut u8,
        len: usize,
        free: unsafe fn(*mut u8, usize),
    ) {
        (*s).flags = STR_FLAG_EXTERNAL;
        (*s).len = len as u32;
        (*s).left = null_mut();
        (*s).right = null_mut();
        (*s).data = data;
        (*s).external_free = Some(free);
    }
}

/// The fat inline kinds are a `JsString` with trailing character storage.
#[repr(C)]
pub struct InlineString {
    pub(crate) base: JsString,
    pub(crate) storage: [u8; INLINE_STRING_CAPACITY],
}

#[repr(C)]
pub struct Shape {
    pub(crate) header: CellHeader,
    pub(crate) base: *mut BaseShape,
    pub(crate) parent: *mut Shape,
    /// Property name; always an atom.
    pub(crate) prop_atom: *mut JsString,
    pub(crate) slot: u32,
    pub(crate) attrs: u32,
}

/// A shape carrying getter/setter objects.
#[repr(C)]
pub struct AccessorShape {
    pub(crate) shape: Shape,
    pub(crate) getter: *mut JsObject,
    pub(crate) setter: *mut JsObject,
}

#[repr(C)]
pub struct BaseShape {
    pub(crate) header: CellHeader,
    pub(crate) flags: u32,
    pub(crate) _pad: u32,
    pub(crate) proto: *mut JsObject,
}

#[repr(C)]
pub struct ObjectGroup {
    pub(crate) header: CellHeader,
    pub(crate) proto: *mut JsObject,
    /// Typed-object descriptor edge; groups are updated before plain cells
    /// during compaction because of this edge.
    pub(crate) descriptor: *mut ObjectGroup,
    /// Owning compartment. Not a GC edge.
    pub(crate) compartment: *mut crate::gc::zone::Compartment,
}

#[repr(C)]
pub struct Script {
    pub(crate) header: CellHeader,
    pub(crate) source: *mut JsString,
    pub(crate) scope: *mut Scope,
    /// Inner (nested function) scripts. Owned array.
    pub(crate) inner: *mut *mut Script,
    pub(crate) inner_len: u32,
    pub(crate) _pad: u32,
}

impl Script {
    pub(crate) unsafe fn init(
        s: *mut Script,
        source: *mut JsString,
        scope: *mut Scope,
        inner: Box<[*mut Script]>,
    ) {
        (*s).source = source;
        (*s).scope = scope;
        (*s).inner_len = inner.len() as u32;
        (*s).inner = if inner.is_empty() {
            null_mut()
        } else {
            Box::into_raw(inner) as *mut *mut Script
        };
        (*s)._pad = 0;
    }

    pub(crate) fn inner_scripts(&self) -> &[*mut Script] {
        if self.inner.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.inner, self.inner_len as usize) }
        }
    }
}

#[repr(C)]
pub struct LazyScript {
    pub(crate) header: CellHeader,
    pub(crate) script: *mut Script,
    pub(crate) scope: *mut Scope,
    pub(crate) source: *mut JsString,
}

#[repr(C)]
pub struct Symbol {
    pub(crate) header: CellHeader,
    pub(crate) description: *mut JsString,
    pub(crate) code: u32,
    pub(crate) _pad: u32,
}

#[repr(C)]
pub struct JitCode {
    pub(crate) header: CellHeader,
    pub(crate) script: *mut Script,
    /// Owned code bytes.
    pub(crate) code: *mut u8,
    pub(crate) code_size: u32,
    pub(crate) _pad: u32,
}

#[repr(C)]
pub struct Scope {
    pub(crate) header: CellHeader,
    pub(crate) enclosing: *mut Scope,
    /// Bound names; atoms. Owned array.
    pub(crate) names: *mut *mut JsString,
    pub(crate) name_count: u32,
    pub(crate) kind: u32,
}

impl Scope {
    pub(crate) unsafe fn init(
        s: *mut Scope,
        enclosing: *mut Scope,
        names: Box<[*mut JsString]>,
        kind: u32,
    ) {
        (*s).enclosing = enclosing;
        (*s).name_count = names.len() as u32;
        (*s).names = if names.is_empty() {
            null_mut()
        } else {
            Box::into_raw(names) as *mut *mut JsString
        };
        (*s).kind = kind;
    }

    pub(crate) fn name_atoms(&self) -> &[*mut JsString] {
        if self.names.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.names, self.name_count as usize) }
        }
    }
}

#[repr(C)]
pub struct RegExpShared {
    pub(crate) header: CellHeader,
    pub(crate) source: *mut JsString,
    pub(crate) flags: u32,
    pub(crate) _pad: u32,
}

unsafe fn free_owned_slice<T>(ptr: *mut T, len: usize) {
    if !ptr.is_null() && len > 0 {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
    }
}

/// Release the malloc'd side data a dead cell owns. This is the whole
/// finalization story: kinds whose rows in the kind table say
/// `background_finalizable` only ever reach this from the helper thread.
///
/// Must not touch other cells; the rest of the region may already be dead.
pub unsafe fn finalize_cell(cell: *mut CellHeader, kind: AllocKind) {
    match kind {
        k if k.is_object() => {
            let obj = cell as *mut JsObject;
            free_owned_slice((*obj).dyn_slots, (*obj).dyn_capacity as usize);
            (*obj).dyn_slots = null_mut();
            (*obj).dyn_capacity = 0;
        }
        AllocKind::String | AllocKind::Atom => {
            let s = cell as *mut JsString;
            if !(*s).is_rope() && !(*s).is_inline() {
                free_owned_slice((*s).data, (*s).len as usize);
                (*s).data = null_mut();
            }
        }
        AllocKind::ExternalString => {
            let s = cell as *mut JsString;
            if let Some(free) = (*s).external_free {
                free((*s).data, (*s).len as usize);
                (*s).data = null_mut();
            }
        }
        AllocKind::Script => {
            let s = cell as *mut Script;
            free_owned_slice((*s).inner, (*s).inner_len as usize);
            (*s).inner = null_mut();
        }
        AllocKind::Scope => {
            let s = cell as *mut Scope;
            free_owned_slice((*s).names, (*s).name_count as usize);
            (*s).names = null_mut();
        }
        AllocKind::JitCode => {
            let c = cell as *mut JitCode;
            free_owned_slice((*c).code, (*c).code_size as usize);
            (*c).code = null_mut();
        }
        // Inline strings, shapes, groups, symbols, lazy scripts and regexp
        // shareds own nothing outside their cell.
        _ => {}
    }
}

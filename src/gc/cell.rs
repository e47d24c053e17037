//! Cell headers.
//!
//! Every GC thing starts with a single machine word that encodes the kind
//! tag, the tri-color mark state, the uid/permanent flags and, while a
//! relocation is in flight, the forwarding address. Packing everything into
//! one atomic word is what lets `mark_if_unmarked` race safely against the
//! header writes minor GC does when it promotes a cell.
//!
//! Word layout (64-bit):
//!
//! ```text
//!  bit 0        forwarded; the word is `new_address | 1` and nothing else
//!  bit 1        black mark bit
//!  bit 2        gray mark bit
//!  bit 3        uid assigned
//!  bit 4        permanent (permanent atom / well-known symbol)
//!  bits 8..16   alloc kind
//!  bits 16..32  zone index within the owning zone group (nursery cells)
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::kinds::AllocKind;

/// Cells are always allocated at 16-byte boundaries, which is what frees the
/// low bits of a forwarding address for the tag.
pub const CELL_ALIGN: usize = 16;

const FORWARDED_BIT: usize = 1 << 0;
const BLACK_BIT: usize = 1 << 1;
const GRAY_BIT: usize = 1 << 2;
const MARK_MASK: usize = BLACK_BIT | GRAY_BIT;
const UID_BIT: usize = 1 << 3;
const PERMANENT_BIT: usize = 1 << 4;
const KIND_SHIFT: usize = 8;
const KIND_MASK: usize = 0xff << KIND_SHIFT;
const ZONE_INDEX_SHIFT: usize = 16;
const ZONE_INDEX_MASK: usize = 0xffff << ZONE_INDEX_SHIFT;

/// Tri-color mark state. White cells are collected, gray cells have been
/// reached but not scanned (and are what the cycle collector consumes),
/// black cells are fully scanned.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CellColor {
    White,
    Gray,
    Black,
}

#[repr(C)]
pub struct CellHeader {
    word: AtomicUsize,
}

impl CellHeader {
    pub fn new_word(kind: AllocKind, zone_index: u16) -> usize {
        ((kind as usize) << KIND_SHIFT) | ((zone_index as usize) << ZONE_INDEX_SHIFT)
    }

    /// Initialize a freshly allocated cell's header. Release ordering so a
    /// thread that observes the published cell pointer also observes the
    /// kind tag.
    pub fn init(&self, kind: AllocKind, zone_index: u16) {
        self.word
            .store(Self::new_word(kind, zone_index), Ordering::Release);
    }

    #[inline(always)]
    fn load(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn kind(&self) -> AllocKind {
        let w = self.load();
        debug_assert!(w & FORWARDED_BIT == 0, "kind read from forwarded cell");
        AllocKind::from_index(((w & KIND_MASK) >> KIND_SHIFT) as usize)
    }

    #[inline(always)]
    pub fn zone_index(&self) -> u16 {
        ((self.load() & ZONE_INDEX_MASK) >> ZONE_INDEX_SHIFT) as u16
    }

    pub fn color(&self) -> CellColor {
        let w = self.load();
        if w & BLACK_BIT != 0 {
            CellColor::Black
        } else if w & GRAY_BIT != 0 {
            CellColor::Gray
        } else {
            CellColor::White
        }
    }

    #[inline(always)]
    pub fn is_marked_black(&self) -> bool {
        self.load() & BLACK_BIT != 0
    }

    #[inline(always)]
    pub fn is_marked_gray(&self) -> bool {
        self.load() & GRAY_BIT != 0
    }

    #[inline(always)]
    pub fn is_marked_any(&self) -> bool {
        self.load() & MARK_MASK != 0
    }

    pub fn is_marked(&self, color: CellColor) -> bool {
        match color {
            CellColor::White => !self.is_marked_any(),
            CellColor::Gray => self.is_marked_gray(),
            CellColor::Black => self.is_marked_black(),
        }
    }

    /// Try to advance the mark state to `color`. Returns true if this call
    /// did the marking, false if the cell already was at least as marked.
    ///
    /// Marking black succeeds from white and from gray (the gray→black
    /// upgrade of the read barrier); marking gray succeeds only from white.
    /// A CAS loop rather than a plain RMW: promotion can be writing this
    /// word concurrently and we must never resurrect a forwarded pattern.
    pub fn mark_if_unmarked(&self, color: CellColor) -> bool {
        let mut cur = self.load();
        loop {
            debug_assert!(cur & FORWARDED_BIT == 0);
            let next = match color {
                CellColor::Black => {
                    if cur & BLACK_BIT != 0 {
                        return false;
                    }
                    (cur & !GRAY_BIT) | BLACK_BIT
                }
                CellColor::Gray => {
                    if cur & MARK_MASK != 0 {
                        return false;
                    }
                    cur | GRAY_BIT
                }
                CellColor::White => return false,
            };
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop the mark bits back to white. Sweep-time only.
    pub fn unmark(&self) {
        let w = self.load();
        self.word.store(w & !MARK_MASK, Ordering::Release);
    }

    pub fn is_permanent(&self) -> bool {
        self.load() & PERMANENT_BIT != 0
    }

    pub fn set_permanent(&self) {
        self.word.fetch_or(PERMANENT_BIT, Ordering::AcqRel);
    }

    pub fn has_uid(&self) -> bool {
        self.load() & UID_BIT != 0
    }

    pub fn set_has_uid(&self) {
        self.word.fetch_or(UID_BIT, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.load() & FORWARDED_BIT != 0
    }

    /// Overwrite the header with a forwarding overlay. After this the cell's
    /// other fields must not be read through this address.
    pub fn forward_to(&self, new_addr: *mut CellHeader) {
        debug_assert_eq!(new_addr as usize & (CELL_ALIGN - 1), 0);
        self.word
            .store(new_addr as usize | FORWARDED_BIT, Ordering::Release);
    }

    pub fn forwarded_target(&self) -> Option<NonNull<CellHeader>> {
        let w = self.load();
        if w & FORWARDED_BIT == 0 {
            return None;
        }
        NonNull::new((w & !FORWARDED_BIT) as *mut CellHeader)
    }
}

/// Chase a maybe-forwarded pointer to the cell's current address.
#[inline]
pub unsafe fn maybe_forwarded(cell: *mut CellHeader) -> *mut CellHeader {
    match (*cell).forwarded_target() {
        Some(t) => t.as_ptr(),
        None => cell,
    }
}

/// Typed pointer to a cell payload. `T` must be `#[repr(C)]` with a
/// `CellHeader` as its first field.
#[repr(transparent)]
pub struct Gc<T> {
    ptr: NonNull<T>,
}

impl<T> Gc<T> {
    pub unsafe fn from_raw(ptr: *mut T) -> Gc<T> {
        Gc {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_cell(self) -> *mut CellHeader {
        self.ptr.as_ptr() as *mut CellHeader
    }

    pub fn header(&self) -> &CellHeader {
        unsafe { &*(self.ptr.as_ptr() as *const CellHeader) }
    }

    pub fn ptr_eq(self, other: Gc<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Copy for Gc<T> {}
impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> std::ops::Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> std::ops::DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

impl<T> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc({:p})", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CellHeader {
        let h = CellHeader {
            word: AtomicUsize::new(0),
        };
        h.init(AllocKind::Object4, 3);
        h
    }

    #[test]
    fn init_encodes_kind_and_zone() {
        let h = header();
        assert_eq!(h.kind(), AllocKind::Object4);
        assert_eq!(h.zone_index(), 3);
        assert_eq!(h.color(), CellColor::White);
        assert!(!h.is_forwarded());
    }

    #[test]
    fn mark_transitions() {
        let h = header();
        assert!(h.mark_if_unmarked(CellColor::Gray));
        assert_eq!(h.color(), CellColor::Gray);
        // Gray again is a no-op.
        assert!(!h.mark_if_unmarked(CellColor::Gray));
        // Gray upgrades to black.
        assert!(h.mark_if_unmarked(CellColor::Black));
        assert_eq!(h.color(), CellColor::Black);
        assert!(!h.mark_if_unmarked(CellColor::Black));
        h.unmark();
        assert_eq!(h.color(), CellColor::White);
        assert_eq!(h.kind(), AllocKind::Object4);
    }

    #[test]
    fn mark_is_idempotent_over_repeats() {
        let h = header();
        assert!(h.mark_if_unmarked(CellColor::Black));
        for _ in 0..10 {
            assert!(!h.mark_if_unmarked(CellColor::Black));
        }
        assert_eq!(h.color(), CellColor::Black);
    }

    #[test]
    fn forwarding_roundtrip() {
        let h = header();
        let target = 0xdead0 as *mut CellHeader;
        h.forward_to(target);
        assert!(h.is_forwarded());
        assert_eq!(h.forwarded_target().unwrap().as_ptr(), target);
    }
}

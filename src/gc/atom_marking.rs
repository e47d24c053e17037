//! Atom liveness accounting.
//!
//! Atoms (and the other residents of the atoms zone) are shared by every
//! zone, so their liveness is a union: each zone keeps a dense bitmap of the
//! atom indices it references, and an atom survives a full GC iff some live
//! zone's bitmap names it, some root does, or it is permanent.
//!
//! Indices are positional: every atoms-zone region is handed a base index at
//! creation and a cell's index is base + its slot in the region, so no side
//! table is needed to go from cell to bit.

use super::cell::{CellColor, CellHeader};
use super::region::{region_of, RegionHeader};
use super::runtime::GcRuntime;

pub struct DenseBitmap {
    words: Vec<usize>,
}

const BITS: usize = usize::BITS as usize;

impl DenseBitmap {
    pub fn new() -> DenseBitmap {
        DenseBitmap { words: Vec::new() }
    }

    pub fn set(&mut self, index: usize) {
        let word = index / BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % BITS);
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / BITS)
            .map_or(false, |w| w & (1 << (index % BITS)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// `self |= other`.
    pub fn union_with(&mut self, other: &DenseBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for DenseBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime-wide atom marking state. Lives behind the exclusive-access lock
/// with the rest of the atoms zone.
pub struct AtomMarkingRuntime {
    /// Next base index for a fresh atoms-zone region.
    next_base: u32,
    /// Atoms referenced directly from roots during the current mark.
    pub roots_bitmap: DenseBitmap,
}

impl AtomMarkingRuntime {
    pub fn new() -> AtomMarkingRuntime {
        AtomMarkingRuntime {
            next_base: 0,
            roots_bitmap: DenseBitmap::new(),
        }
    }

    /// Hand out index space for a new atoms-zone region.
    pub fn reserve_region_indexes(&mut self, capacity: usize) -> u32 {
        let base = self.next_base;
        self.next_base += capacity as u32;
        base
    }
}

impl Default for AtomMarkingRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitmap index of an atoms-zone cell.
#[inline]
pub unsafe fn atom_index(cell: *const CellHeader) -> usize {
    let region: *mut RegionHeader = region_of(cell);
    (*region).atom_base as usize + (*region).index_of(cell)
}

/// Refine atom marks at the Mark→Sweep transition: union every zone's
/// bitmap (collected zones rebuilt theirs during marking, uncollected zones
/// kept theirs) with the roots bitmap, then mark the named atoms black so
/// the atoms-zone sweep keeps exactly those.
pub unsafe fn update_atom_marking(rt: &mut GcRuntime) {
    let mut union = DenseBitmap::new();
    union.union_with(&rt.atom_marking.roots_bitmap);
    rt.for_each_zone(|zone| {
        if !(*zone).is_atoms_zone {
            union.union_with(&(*zone).atom_bitmap);
        }
    });

    let atoms_zone = rt.atoms_zone_ptr();
    if atoms_zone.is_null() || !(*atoms_zone).is_collecting() {
        return;
    }
    for kind in super::kinds::AllocKind::ALL {
        for region in (*atoms_zone).iter_regions(kind) {
            for cell in (*region).iter_cells() {
                if (*cell).is_permanent() {
                    continue;
                }
                if union.get(atom_index(cell)) {
                    (*cell).mark_if_unmarked(CellColor::Black);
                }
            }
        }
    }
}

//! Heap regions.
//!
//! All GC memory — nursery and tenured alike — is carved into 16 KiB
//! regions aligned to their own size, so the owning region of any cell is
//! one mask away. A tenured region holds cells of exactly one kind, which
//! lets iteration and sweeping run without per-cell tag lookups; nursery
//! regions are bump-filled with mixed kinds and are never iterated.
//!
//! A region begins with a [`RegionHeader`] and the payload starts at a fixed
//! 256-byte offset. Allocation state lives in a per-region bitmap; the mark
//! colors live in the cell headers themselves.

use bitflags::bitflags;

use super::allocator::GcError;
use super::cell::CellHeader;
use super::kinds::{size_of_kind, AllocKind};
use super::os::{self, Mapping};
use super::zone::{Zone, ZoneGroup};
use super::{round_up, Address, K};

pub const REGION_SIZE: usize = 16 * K;
pub const FIRST_CELL_OFFSET: usize = 256;
pub const REGION_PAYLOAD: usize = REGION_SIZE - FIRST_CELL_OFFSET;
const BITMAP_WORDS: usize = 16;

/// Regions per mapped chunk.
const CHUNK_REGIONS: usize = 64;
const CHUNK_SIZE: usize = CHUNK_REGIONS * REGION_SIZE;

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct RegionFlags: u8 {
        const NURSERY = 1 << 0;
        /// Selected as a compaction relocation source.
        const RELOCATING = 1 << 1;
        /// On the marker's delayed-marking list.
        const DELAYED_MARKING = 1 << 2;
    }
}

/// Free cells are threaded into a singly linked list through their first
/// word. Only valid while the cell is unallocated.
#[repr(C)]
pub struct FreeCell {
    pub(crate) next: *mut FreeCell,
}

#[repr(C)]
pub struct RegionHeader {
    pub(crate) zone: *mut Zone,
    pub(crate) group: *mut ZoneGroup,
    /// Next region of the same kind in the owning zone.
    pub(crate) next: *mut RegionHeader,
    /// Link for the marker's delayed-marking list.
    pub(crate) delayed_link: *mut RegionHeader,
    pub(crate) free_head: *mut FreeCell,
    /// First atom index of this region (atoms-zone regions only).
    pub(crate) atom_base: u32,
    pub(crate) live_count: u32,
    kind: u8,
    pub(crate) flags: RegionFlags,
    _pad: [u8; 6],
    bitmap: [u64; BITMAP_WORDS],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= FIRST_CELL_OFFSET);

impl RegionHeader {
    pub(crate) unsafe fn init(
        at: Address,
        kind: AllocKind,
        zone: *mut Zone,
        group: *mut ZoneGroup,
        flags: RegionFlags,
        atom_base: u32,
    ) {
        debug_assert_eq!(at.to_usize() % REGION_SIZE, 0);
        let region = at.to_mut_ptr::<RegionHeader>();
        (*region).zone = zone;
        (*region).group = group;
        (*region).next = std::ptr::null_mut();
        (*region).delayed_link = std::ptr::null_mut();
        (*region).free_head = std::ptr::null_mut();
        (*region).atom_base = atom_base;
        (*region).live_count = 0;
        (*region).kind = kind as u8;
        (*region).flags = flags;
        (*region).bitmap = [0; BITMAP_WORDS];
        if !flags.contains(RegionFlags::NURSERY) {
            (*region).build_initial_free_list();
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> AllocKind {
        AllocKind::from_index(self.kind as usize)
    }

    #[inline(always)]
    pub fn is_nursery(&self) -> bool {
        self.flags.contains(RegionFlags::NURSERY)
    }

    #[inline(always)]
    pub fn cell_size(&self) -> usize {
        debug_assert!(!self.is_nursery());
        size_of_kind(self.kind())
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        REGION_PAYLOAD / self.cell_size()
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        Address::from_ptr(self as *const RegionHeader)
    }

    #[inline(always)]
    pub fn payload(&self) -> Address {
        self.start().offset(FIRST_CELL_OFFSET)
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.start().offset(REGION_SIZE)
    }

    #[inline]
    pub fn cell_at(&self, index: usize) -> *mut CellHeader {
        debug_assert!(index < self.capacity());
        self.payload()
            .offset(index * self.cell_size())
            .to_mut_ptr::<CellHeader>()
    }

    #[inline]
    pub fn index_of(&self, cell: *const CellHeader) -> usize {
        let offset = Address::from_ptr(cell).offset_from(self.payload());
        debug_assert_eq!(offset % self.cell_size(), 0);
        offset / self.cell_size()
    }

    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set_allocated(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    pub(crate) fn clear_allocated(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_null()
    }

    /// Fraction-free test used when compaction picks relocation sources.
    pub fn is_fragmented(&self) -> bool {
        (self.live_count as usize) < self.capacity() / 2
    }

    /// Thread every cell of a fresh region into the free list.
    unsafe fn build_initial_free_list(&mut self) {
        let size = self.cell_size();
        let mut head: *mut FreeCell = std::ptr::null_mut();
        // Built back to front so allocation walks the region front to back.
        for index in (0..self.capacity()).rev() {
            let cell = self.payload().offset(index * size).to_mut_ptr::<FreeCell>();
            (*cell).next = head;
            head = cell;
        }
        self.free_head = head;
    }

    /// Pop one free cell. The caller writes the cell header.
    pub(crate) unsafe fn alloc_cell(&mut self) -> Option<*mut CellHeader> {
        let cell = self.free_head;
        if cell.is_null() {
            return None;
        }
        self.free_head = (*cell).next;
        let index = self.index_of(cell as *const CellHeader);
        debug_assert!(!self.is_allocated(index));
        self.set_allocated(index);
        self.live_count += 1;
        Some(cell as *mut CellHeader)
    }

    /// Return one cell to the free list. Sweep-time only.
    pub(crate) unsafe fn free_cell(&mut self, cell: *mut CellHeader) {
        let index = self.index_of(cell);
        debug_assert!(self.is_allocated(index));
        self.clear_allocated(index);
        self.live_count -= 1;
        let free = cell as *mut FreeCell;
        (*free).next = self.free_head;
        self.free_head = free;
    }

    pub fn iter_cells(&self) -> RegionCellIter {
        RegionCellIter {
            region: self as *const RegionHeader,
            index: 0,
        }
    }
}

/// Iterator over the allocated cells of one region.
pub struct RegionCellIter {
    region: *const RegionHeader,
    index: usize,
}

impl Iterator for RegionCellIter {
    type Item = *mut CellHeader;

    fn next(&mut self) -> Option<*mut CellHeader> {
        unsafe {
            let region = &*self.region;
            while self.index < region.capacity() {
                let index = self.index;
                self.index += 1;
                if region.is_allocated(index) {
                    return Some(region.cell_at(index));
                }
            }
            None
        }
    }
}

/// Owning region of a cell.
#[inline(always)]
pub fn region_of(cell: *const CellHeader) -> *mut RegionHeader {
    ((cell as usize) & !(REGION_SIZE - 1)) as *mut RegionHeader
}

/// Is this cell in some group's nursery?
#[inline(always)]
pub unsafe fn in_nursery(cell: *const CellHeader) -> bool {
    (*region_of(cell)).is_nursery()
}

#[inline(always)]
pub unsafe fn zone_of(cell: *const CellHeader) -> *mut Zone {
    (*region_of(cell)).zone
}

struct Chunk {
    mapping: Mapping,
    first: Address,
    nregions: usize,
    next_unused: usize,
}

impl Chunk {
    fn new() -> Result<Chunk, GcError> {
        // Over-map by one region so the first region can be aligned.
        let mapping =
            Mapping::new(CHUNK_SIZE + REGION_SIZE).map_err(|_| GcError::OutOfMemory)?;
        let first = Address::from(round_up(mapping.start().to_usize(), REGION_SIZE));
        Ok(Chunk {
            mapping,
            first,
            nregions: CHUNK_REGIONS,
            next_unused: 0,
        })
    }

    fn take_region(&mut self) -> Option<Address> {
        if self.next_unused == self.nregions {
            return None;
        }
        let at = self.first.offset(self.next_unused * REGION_SIZE);
        self.next_unused += 1;
        Some(at)
    }
}

/// Process-wide pool of heap regions. Fresh regions come from mapped chunks;
/// released regions are recycled, and the Decommit phase hands their pages
/// back to the kernel.
pub struct RegionPool {
    chunks: Vec<Chunk>,
    free: Vec<Address>,
    /// Regions currently handed out.
    live_regions: usize,
}

impl RegionPool {
    pub fn new() -> RegionPool {
        RegionPool {
            chunks: Vec::new(),
            free: Vec::new(),
            live_regions: 0,
        }
    }

    pub fn live_regions(&self) -> usize {
        self.live_regions
    }

    pub fn free_regions(&self) -> usize {
        self.free.len()
    }

    pub fn heap_bytes(&self) -> usize {
        self.chunks.len() * CHUNK_SIZE
    }

    pub unsafe fn alloc_region(
        &mut self,
        kind: AllocKind,
        zone: *mut Zone,
        group: *mut ZoneGroup,
        flags: RegionFlags,
        atom_base: u32,
    ) -> Result<*mut RegionHeader, GcError> {
        let at = match self.free.pop() {
            Some(at) => at,
            None => match self.chunks.last_mut().and_then(|c| c.take_region()) {
                Some(at) => at,
                None => {
                    self.chunks.push(Chunk::new()?);
                    self.chunks
                        .last_mut()
                        .and_then(|c| c.take_region())
                        .ok_or(GcError::OutOfMemory)?
                }
            },
        };
        // Recycled regions may carry stale contents; headers must start
        // clean.
        std::ptr::write_bytes(at.to_mut_ptr::<u8>(), 0, FIRST_CELL_OFFSET);
        RegionHeader::init(at, kind, zone, group, flags, atom_base);
        self.live_regions += 1;
        Ok(at.to_mut_ptr::<RegionHeader>())
    }

    pub unsafe fn release_region(&mut self, region: *mut RegionHeader) {
        debug_assert!((*region).is_nursery() || (*region).is_empty());
        self.live_regions -= 1;
        self.free.push(Address::from_ptr(region));
    }

    /// Hand every free region's pages back to the kernel. Runs in the
    /// Decommit state and after nursery shrinking.
    pub fn decommit_free_regions(&mut self) {
        for at in &self.free {
            os::discard(*at, REGION_SIZE);
        }
    }
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::CellColor;

    unsafe fn test_region(pool: &mut RegionPool, kind: AllocKind) -> *mut RegionHeader {
        pool.alloc_region(
            kind,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            RegionFlags::empty(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn regions_are_aligned_and_typed() {
        let mut pool = RegionPool::new();
        unsafe {
            let region = test_region(&mut pool, AllocKind::Shape);
            assert_eq!(region as usize % REGION_SIZE, 0);
            assert_eq!((*region).kind(), AllocKind::Shape);
            assert!((*region).capacity() > 0);
        }
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut pool = RegionPool::new();
        unsafe {
            let region = test_region(&mut pool, AllocKind::Object0);
            let cap = (*region).capacity();
            let mut cells = Vec::new();
            while let Some(cell) = (*region).alloc_cell() {
                (*cell).init(AllocKind::Object0, 0);
                cells.push(cell);
            }
            assert_eq!(cells.len(), cap);
            assert!((*region).is_full());
            assert_eq!((*region).iter_cells().count(), cap);

            for &cell in &cells {
                assert_eq!(region_of(cell), region);
            }

            (*region).free_cell(cells[0]);
            assert_eq!((*region).live_count as usize, cap - 1);
            let again = (*region).alloc_cell().unwrap();
            assert_eq!(again, cells[0]);
        }
    }

    #[test]
    fn iter_skips_free_cells() {
        let mut pool = RegionPool::new();
        unsafe {
            let region = test_region(&mut pool, AllocKind::Object4);
            let a = (*region).alloc_cell().unwrap();
            let b = (*region).alloc_cell().unwrap();
            let c = (*region).alloc_cell().unwrap();
            (*a).init(AllocKind::Object4, 0);
            (*b).init(AllocKind::Object4, 0);
            (*c).init(AllocKind::Object4, 0);
            (*region).free_cell(b);
            let cells: Vec<_> = (*region).iter_cells().collect();
            assert_eq!(cells, vec![a, c]);
        }
    }

    #[test]
    fn released_regions_are_recycled() {
        let mut pool = RegionPool::new();
        unsafe {
            let region = test_region(&mut pool, AllocKind::String);
            let at = region as usize;
            // Dirty a cell, release, re-allocate: header must be rebuilt.
            let cell = (*region).alloc_cell().unwrap();
            (*cell).init(AllocKind::String, 0);
            (*cell).mark_if_unmarked(CellColor::Black);
            (*region).free_cell(cell);
            pool.release_region(region);

            let again = test_region(&mut pool, AllocKind::Symbol);
            assert_eq!(again as usize, at);
            assert_eq!((*again).kind(), AllocKind::Symbol);
            assert_eq!((*again).live_count, 0);
        }
    }
}

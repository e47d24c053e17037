//! OS memory plumbing: anonymous mappings for heap chunks and page-level
//! discard for the Decommit phase.
//!
//! Chunks are mapped read-write up front; "decommit" here is
//! `madvise(MADV_DONTNEED)` so the kernel can reclaim the pages while the
//! reservation stays valid for re-use.

use memmap2::MmapMut;

use super::Address;

pub fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

pub fn is_page_aligned(v: usize) -> bool {
    v & (page_size() - 1) == 0
}

/// An anonymous read-write mapping. Unmapped on drop.
pub struct Mapping {
    map: MmapMut,
}

impl Mapping {
    pub fn new(size: usize) -> std::io::Result<Mapping> {
        let map = MmapMut::map_anon(size)?;
        Ok(Mapping { map })
    }

    pub fn start(&self) -> Address {
        Address::from_ptr(self.map.as_ptr())
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn end(&self) -> Address {
        self.start().offset(self.size())
    }
}

/// Tell the kernel the range is unused. The mapping stays readable and
/// writable; touching it again demand-zeroes fresh pages.
pub fn discard(ptr: Address, size: usize) {
    debug_assert!(is_page_aligned(ptr.to_usize()));
    debug_assert!(is_page_aligned(size));

    #[cfg(unix)]
    {
        let res = unsafe { libc::madvise(ptr.to_mut_ptr(), size, libc::MADV_DONTNEED) };
        if res != 0 {
            panic!("discarding memory with madvise() failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, size);
    }
}

//! Runtime-wide collector parameters and the zeal (debug perturbation)
//! configuration.

use std::fmt;

/// Debug-only perturbation modes. Each mode deterministically enables one
/// named behavior; there is no functional contract beyond that.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ZealMode {
    /// Collect on every Nth allocation (N = zeal frequency).
    Alloc = 1,
    /// Run the pre-barrier verifier around every collection.
    VerifierPre = 4,
    /// Periodic minor GCs.
    GenerationalGc = 7,
    /// Incremental GC that marks roots in the first slice then finishes.
    IncrementalRootsThenFinish = 8,
    /// Incremental GC that marks everything then finishes.
    IncrementalMarkAllThenFinish = 9,
    /// Incremental GC in many small slices.
    IncrementalMultipleSlices = 10,
    /// Walk store-buffer coverage on every minor GC.
    CheckStoreBufferOnMinorGc = 13,
    /// Compact on every collection.
    Compact = 14,
    /// Validate the whole heap after every collection.
    CheckHeapAfterGc = 15,
    /// Assert the nursery really is empty after every minor GC.
    CheckNursery = 16,
}

impl ZealMode {
    pub const LIMIT: u32 = 17;

    pub fn from_u8(v: u8) -> Option<ZealMode> {
        Some(match v {
            1 => ZealMode::Alloc,
            4 => ZealMode::VerifierPre,
            7 => ZealMode::GenerationalGc,
            8 => ZealMode::IncrementalRootsThenFinish,
            9 => ZealMode::IncrementalMarkAllThenFinish,
            10 => ZealMode::IncrementalMultipleSlices,
            13 => ZealMode::CheckStoreBufferOnMinorGc,
            14 => ZealMode::Compact,
            15 => ZealMode::CheckHeapAfterGc,
            16 => ZealMode::CheckNursery,
            _ => return None,
        })
    }
}

/// Error produced by [`GcParams::parse_zeal`] / `GcRuntime::parse_and_set_zeal`.
#[derive(Debug, thiserror::Error)]
#[error("bad zeal specification `{spec}`")]
pub struct BadZealSpec {
    pub spec: String,
}

/// Collector parameters. Built once and handed to `GcRuntime::new`.
pub struct GcParams {
    pub(crate) nursery_bytes: usize,
    pub(crate) max_heap_bytes: usize,
    pub(crate) generational: bool,
    pub(crate) incremental: bool,
    pub(crate) compacting: bool,
    pub(crate) background_finalization: bool,
    pub(crate) zeal_bits: u32,
    pub(crate) zeal_frequency: u32,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            nursery_bytes: 1024 * 1024,
            max_heap_bytes: 256 * 1024 * 1024,
            generational: true,
            incremental: true,
            compacting: true,
            background_finalization: true,
            zeal_bits: 0,
            zeal_frequency: 100,
        }
    }
}

impl GcParams {
    pub fn with_nursery_bytes(mut self, bytes: usize) -> Self {
        self.nursery_bytes = bytes;
        self
    }

    pub fn with_max_heap_bytes(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// Disabling generational GC forces every allocation through the tenured
    /// path and turns minor GC into a no-op.
    pub fn with_generational(mut self, enabled: bool) -> Self {
        self.generational = enabled;
        self
    }

    pub fn with_incremental(mut self, enabled: bool) -> Self {
        self.incremental = enabled;
        self
    }

    pub fn with_compacting(mut self, enabled: bool) -> Self {
        self.compacting = enabled;
        self
    }

    pub fn with_background_finalization(mut self, enabled: bool) -> Self {
        self.background_finalization = enabled;
        self
    }

    pub fn with_zeal(mut self, mode: ZealMode, frequency: u32) -> Self {
        self.zeal_bits |= 1 << mode as u32;
        self.zeal_frequency = frequency;
        self
    }

    /// Parse a `mode[;mode...][,frequency]` zeal specification, the same
    /// shape the shell's `gczeal` accepts.
    pub fn parse_zeal(mut self, spec: &str) -> Result<Self, BadZealSpec> {
        let bad = || BadZealSpec { spec: spec.to_string() };
        let (modes, frequency) = match spec.split_once(',') {
            Some((m, f)) => (m, f.parse::<u32>().map_err(|_| bad())?),
            None => (spec, self.zeal_frequency),
        };
        let mut bits = 0u32;
        for part in modes.split(';') {
            let n = part.trim().parse::<u8>().map_err(|_| bad())?;
            if n == 0 {
                bits = 0;
                continue;
            }
            let mode = ZealMode::from_u8(n).ok_or_else(bad)?;
            bits |= 1 << mode as u32;
        }
        self.zeal_bits = bits;
        self.zeal_frequency = frequency;
        Ok(self)
    }

    pub(crate) fn has_zeal(&self, mode: ZealMode) -> bool {
        self.zeal_bits & (1 << mode as u32) != 0
    }
}

impl fmt::Debug for GcParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcParams")
            .field("nursery_bytes", &self.nursery_bytes)
            .field("max_heap_bytes", &self.max_heap_bytes)
            .field("generational", &self.generational)
            .field("incremental", &self.incremental)
            .field("compacting", &self.compacting)
            .field("zeal_bits", &format_args!("{:#x}", self.zeal_bits))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_zeal_single_mode() {
        let p = GcParams::default().parse_zeal("14").unwrap();
        assert!(p.has_zeal(ZealMode::Compact));
        assert_eq!(p.zeal_frequency, 100);
    }

    #[test]
    fn parse_zeal_modes_and_frequency() {
        let p = GcParams::default().parse_zeal("4;10,7").unwrap();
        assert!(p.has_zeal(ZealMode::VerifierPre));
        assert!(p.has_zeal(ZealMode::IncrementalMultipleSlices));
        assert_eq!(p.zeal_frequency, 7);
    }

    #[test]
    fn parse_zeal_zero_clears() {
        let p = GcParams::default()
            .with_zeal(ZealMode::Compact, 10)
            .parse_zeal("0")
            .unwrap();
        assert_eq!(p.zeal_bits, 0);
    }

    #[test]
    fn parse_zeal_rejects_garbage() {
        assert!(GcParams::default().parse_zeal("bogus").is_err());
        assert!(GcParams::default().parse_zeal("2").is_err());
    }
}

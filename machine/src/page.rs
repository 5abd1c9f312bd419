//! Leaf page-table entry attributes, shared by every architecture's cursor
//! implementation.

use bitflags::bitflags;

bitflags! {
    /// Permission and attribute bits for a single mapped page. Architectures
    /// translate this into their native PTE encoding in `CursorPolicy::pte_build`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct PageFlags: u32 {
        const READABLE   = 0b0000_0001;
        const WRITABLE   = 0b0000_0010;
        const EXECUTABLE = 0b0000_0100;
        /// Accessible from unprivileged (userspace) mode.
        const USER       = 0b0000_1000;
        /// Entry survives a global (non-ASID-tagged) TLB flush.
        const GLOBAL     = 0b0001_0000;
    }
}

/// Caching/memory-type attribute for a mapping. The concrete encoding (MAIR
/// index, PAT index, ...) is architecture-specific; this is the
/// architecture-neutral vocabulary the core reasons about.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachingMode {
    WriteBack,
    WriteThrough,
    Uncached,
    /// Device memory: no speculation, no reordering.
    MmioDevice,
}

impl Default for CachingMode {
    fn default() -> Self {
        CachingMode::WriteBack
    }
}

/// Liveness/dirty status recovered from a leaf PTE on unmap, conveyed back
/// to the caller of `unmap_single` (spec §4.1: "conveys dirty/present
/// status").
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PageStatus {
    pub present: bool,
    pub dirty: bool,
}

//! Contracts the core requires from its platform and collaborators.
//!
//! Per spec §1/§9, bus enumeration, the physical allocator, and the boot
//! process are external collaborators; the core only needs the narrow
//! interfaces below. Architectures and platforms implement these traits;
//! `nucleus` is generic over them.

use crate::addr::{PhysAddr, VirtAddr};
use crate::page::{CachingMode, PageFlags, PageStatus};

/// Supplies and reclaims physical page frames. Owned and implemented
/// outside the core (spec §3: "Owned by the PhysicalAllocator (external
/// collaborator)").
pub trait PhysicalAllocator {
    fn allocate_frame(&self) -> Option<PhysAddr>;
    fn free_frame(&self, frame: PhysAddr);
}

/// A monotonic nanosecond clock, read by the TimerEngine.
pub trait ClockSource {
    fn current_nanos(&self) -> u64;
}

/// A per-CPU one-shot hardware alarm. `arm` is called with an absolute
/// deadline in nanoseconds; the platform is responsible for converting this
/// into whatever countdown/compare-register scheme the hardware uses and
/// for calling back into the core's IRQ handler when it fires.
pub trait AlarmTracker {
    fn arm(&self, deadline_nanos: u64);
    fn disarm(&self);
}

/// Policy object describing one architecture's page-table encoding, used by
/// the generic page-table cursor in `nucleus::memory::page_table`.
///
/// This mirrors the source's `CursorPolicy` concept (§9 design notes: "model
/// each level as an arena of frames ... cursor objects traverse the tree").
/// Non-leaf and leaf entries are both encoded as `u64`; `MAX_LEVELS` and
/// `BITS_PER_LEVEL` describe how a virtual address is split across levels.
pub trait CursorPolicy {
    /// Upper bound on table depth (e.g. 4 for a 4-level architecture).
    const MAX_LEVELS: usize;
    /// Levels actually in use for this configuration (<= MAX_LEVELS).
    fn num_levels(&self) -> usize;
    /// Address bits resolved per level.
    const BITS_PER_LEVEL: usize;

    fn pte_page_present(&self, pte: u64) -> bool;
    fn pte_page_address(&self, pte: u64) -> PhysAddr;
    fn pte_page_status(&self, pte: u64) -> PageStatus;
    /// Clears the dirty bit in-place, returning the status observed before
    /// clearing.
    fn pte_clean(&self, pte: &mut u64) -> PageStatus;
    fn pte_build(&self, frame: PhysAddr, flags: PageFlags, caching: CachingMode) -> u64;

    fn pte_table_present(&self, pte: u64) -> bool;
    fn pte_table_address(&self, pte: u64) -> PhysAddr;
    /// Allocates a fresh page-table frame and returns a non-leaf PTE
    /// pointing at it.
    fn pte_new_table(&self, frame: PhysAddr) -> u64;
}

/// Invalidates stale TLB entries. Implemented by the architecture layer;
/// the shootdown protocol in `nucleus::memory::page_space` only ever calls
/// through this trait, never touches TLB-control registers itself (spec
/// §1: "no specification of a particular CPU ISA").
pub trait TlbInvalidate {
    /// Invalidates `[va, va + len)` for the ASID currently held in `slot`
    /// on this CPU.
    fn invalidate_range(&self, slot: usize, va: VirtAddr, len: usize);
    /// Invalidates every entry tagged with the ASID held in `slot` (used
    /// for "large" ranges and for `unbind`).
    fn invalidate_slot(&self, slot: usize);
}

/// Broadcasts the interrupt that drives a peer CPU's shootdown IPI
/// handler (spec §4.1: "broadcast a shootdown IPI to all CPUs excluding
/// self").
pub trait IpiSender {
    fn send_shootdown_ipi(&self, targets: &[crate::percpu::CpuId]);
}

/// Addresses a single leaf within an address space's page table at a given
/// virtual address. The architecture layer supplies this translation; the
/// generic code in `nucleus::memory` never indexes physical memory itself
/// beyond what this trait exposes, keeping raw frame pointers out of the
/// portable core (§9: "never store raw references to sibling or parent
/// frames; re-derive them from the root on each walk").
pub trait PageTableWalker {
    /// Reads the leaf PTE covering `va`, walking from `root`. Returns
    /// `None` if an intermediate level is not present.
    fn read_leaf(&self, root: PhysAddr, va: VirtAddr) -> Option<u64>;

    /// Atomically replaces the leaf PTE covering `va`, allocating
    /// intermediate levels as needed via the supplied allocator. Returns
    /// the previous value.
    fn write_leaf(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        allocator: &dyn PhysicalAllocator,
        new_pte: u64,
    ) -> Result<u64, ()>;
}

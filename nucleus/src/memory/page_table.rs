/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! A generic page-table cursor, parameterised over an architecture's
//! `CursorPolicy` (PTE encoding) and a `FrameStore` (how to read/write a
//! frame's words).
//!
//! Design notes §9 warns against the source's raw pointer graphs: "model
//! each level as an arena of frames ... cursor objects traverse the tree
//! by mapping frame addresses into a short-lived physical window. Never
//! store raw references to sibling or parent frames; re-derive them from
//! the root on each walk." `FrameStore` *is* that physical window: every
//! walk starts at `root` and re-reads each level from the store, it never
//! caches a frame pointer across levels.

use machine::{CachingMode, PageFlags, PageStatus, PageTableWalker, PhysAddr, PhysicalAllocator, VirtAddr};

use crate::error::{Error, Result};

pub use machine::CursorPolicy;

/// Reads and writes one entry of one page-table frame. The concrete
/// implementation (direct-mapped physical memory, a recursive mapping, an
/// explicit TLB-backed window) is architecture-specific and out of this
/// core's scope (spec §1: "no specification of a particular CPU ISA");
/// this trait is the narrow seam the generic cursor needs.
pub trait FrameStore {
    fn read_entry(&self, frame: PhysAddr, index: usize) -> u64;
    fn write_entry(&self, frame: PhysAddr, index: usize, value: u64);
}

/// Lets integration tests drive a [`Cursor`] against
/// [`machine::test_support::MapFrameStore`] — that type lives upstream of
/// this trait, so the impl has to live here rather than alongside it.
#[cfg(feature = "test-helpers")]
impl FrameStore for machine::test_support::MapFrameStore {
    fn read_entry(&self, frame: PhysAddr, index: usize) -> u64 {
        self.read(frame, index)
    }

    fn write_entry(&self, frame: PhysAddr, index: usize, value: u64) {
        self.write(frame, index, value);
    }
}

/// Splits `va` into one index per page-table level, most significant
/// level first.
fn level_indices<P: CursorPolicy>(policy: &P, va: VirtAddr) -> [usize; 8] {
    debug_assert!(P::MAX_LEVELS <= 8, "level_indices index array too small");
    let mut indices = [0usize; 8];
    let raw = va.as_raw();
    let levels = policy.num_levels();
    for (level, slot) in indices.iter_mut().enumerate().take(levels) {
        let shift = machine::PAGE_SHIFT as usize + (levels - 1 - level) * P::BITS_PER_LEVEL;
        *slot = (raw >> shift) & ((1 << P::BITS_PER_LEVEL) - 1);
    }
    indices
}

/// A `PageTableWalker` generic over any architecture's `CursorPolicy` and
/// any `FrameStore`.
pub struct Cursor<P, F> {
    policy: P,
    store: F,
}

impl<P: CursorPolicy, F: FrameStore> Cursor<P, F> {
    pub fn new(policy: P, store: F) -> Self {
        Self { policy, store }
    }

    fn walk_to_leaf(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        allocate_missing: Option<&dyn PhysicalAllocator>,
    ) -> core::result::Result<(PhysAddr, usize), ()> {
        let indices = level_indices(&self.policy, va);
        let levels = self.policy.num_levels();
        let mut table = root;
        for (level, &index) in indices.iter().enumerate().take(levels - 1) {
            let entry = self.store.read_entry(table, index);
            if self.policy.pte_table_present(entry) {
                table = self.policy.pte_table_address(entry);
            } else if let Some(alloc) = allocate_missing {
                let frame = alloc.allocate_frame().ok_or(())?;
                let new_entry = self.policy.pte_new_table(frame);
                self.store.write_entry(table, index, new_entry);
                table = frame;
            } else {
                return Err(());
            }
            let _ = level;
        }
        Ok((table, indices[levels - 1]))
    }
}

impl<P: CursorPolicy, F: FrameStore> PageTableWalker for Cursor<P, F> {
    fn read_leaf(&self, root: PhysAddr, va: VirtAddr) -> Option<u64> {
        let (table, index) = self.walk_to_leaf(root, va, None).ok()?;
        Some(self.store.read_entry(table, index))
    }

    fn write_leaf(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        allocator: &dyn PhysicalAllocator,
        new_pte: u64,
    ) -> core::result::Result<u64, ()> {
        let (table, index) = self.walk_to_leaf(root, va, Some(allocator))?;
        let prior = self.store.read_entry(table, index);
        self.store.write_entry(table, index, new_pte);
        Ok(prior)
    }
}

/// Installs a single leaf mapping (spec §4.1 `map_single`). Fails with
/// `IllegalArgument` if `va` is already mapped.
pub fn map_single<P: CursorPolicy>(
    walker: &dyn PageTableWalker,
    policy: &P,
    allocator: &dyn PhysicalAllocator,
    root: PhysAddr,
    va: VirtAddr,
    frame: PhysAddr,
    flags: PageFlags,
    caching: CachingMode,
) -> Result<()> {
    if !va.is_page_aligned() || !frame.is_page_aligned() {
        return Err(Error::IllegalArgument);
    }
    if let Some(existing) = walker.read_leaf(root, va) {
        if policy.pte_page_present(existing) {
            return Err(Error::IllegalArgument);
        }
    }
    let pte = policy.pte_build(frame, flags, caching);
    walker
        .write_leaf(root, va, allocator, pte)
        .map_err(|_| Error::OutOfMemory)?;
    Ok(())
}

/// Clears a single leaf mapping and returns its prior status (spec §4.1
/// `unmap_single`).
pub fn unmap_single<P: CursorPolicy>(
    walker: &dyn PageTableWalker,
    policy: &P,
    allocator: &dyn PhysicalAllocator,
    root: PhysAddr,
    va: VirtAddr,
) -> Result<PageStatus> {
    if !va.is_page_aligned() {
        return Err(Error::IllegalArgument);
    }
    let prior = walker
        .write_leaf(root, va, allocator, 0)
        .map_err(|_| Error::OutOfMemory)?;
    Ok(policy.pte_page_status(prior))
}

#[cfg(test)]
pub(crate) mod test_support {
    extern crate std;

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A 2-level, 9-bits-per-level software policy used only by tests: 4 KiB
    /// pages, 512 entries per table. Present bit is bit 0, table bit is
    /// bit 1, dirty bit is bit 2; the frame address occupies bits
    /// [12..52).
    pub struct TestPolicy;

    const PRESENT: u64 = 1 << 0;
    const TABLE: u64 = 1 << 1;
    const DIRTY: u64 = 1 << 2;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    impl CursorPolicy for TestPolicy {
        const MAX_LEVELS: usize = 2;
        const BITS_PER_LEVEL: usize = 9;

        fn num_levels(&self) -> usize {
            2
        }

        fn pte_page_present(&self, pte: u64) -> bool {
            pte & PRESENT != 0 && pte & TABLE == 0
        }

        fn pte_page_address(&self, pte: u64) -> PhysAddr {
            PhysAddr::new(pte & ADDR_MASK)
        }

        fn pte_page_status(&self, pte: u64) -> PageStatus {
            PageStatus {
                present: pte & PRESENT != 0,
                dirty: pte & DIRTY != 0,
            }
        }

        fn pte_clean(&self, pte: &mut u64) -> PageStatus {
            let status = self.pte_page_status(*pte);
            *pte &= !DIRTY;
            status
        }

        fn pte_build(&self, frame: PhysAddr, _flags: PageFlags, _caching: CachingMode) -> u64 {
            (frame.as_raw() & ADDR_MASK) | PRESENT
        }

        fn pte_table_present(&self, pte: u64) -> bool {
            pte & PRESENT != 0 && pte & TABLE != 0
        }

        fn pte_table_address(&self, pte: u64) -> PhysAddr {
            PhysAddr::new(pte & ADDR_MASK)
        }

        fn pte_new_table(&self, frame: PhysAddr) -> u64 {
            (frame.as_raw() & ADDR_MASK) | PRESENT | TABLE
        }
    }

    /// A `HashMap`-backed `FrameStore`, standing in for the "short-lived
    /// physical window" a real platform maps.
    #[derive(Default)]
    pub struct MapFrameStore {
        entries: Mutex<HashMap<(u64, usize), u64>>,
    }

    impl FrameStore for MapFrameStore {
        fn read_entry(&self, frame: PhysAddr, index: usize) -> u64 {
            *self
                .entries
                .lock()
                .unwrap()
                .get(&(frame.as_raw(), index))
                .unwrap_or(&0)
        }

        fn write_entry(&self, frame: PhysAddr, index: usize, value: u64) {
            self.entries
                .lock()
                .unwrap()
                .insert((frame.as_raw(), index), value);
        }
    }

    pub struct BumpAllocator {
        next: Mutex<u64>,
    }

    impl BumpAllocator {
        pub fn new(start: u64) -> Self {
            Self {
                next: Mutex::new(start),
            }
        }
    }

    impl PhysicalAllocator for BumpAllocator {
        fn allocate_frame(&self) -> Option<PhysAddr> {
            let mut next = self.next.lock().unwrap();
            let frame = *next;
            *next += machine::PAGE_SIZE as u64;
            Some(PhysAddr::new(frame))
        }

        fn free_frame(&self, _frame: PhysAddr) {}
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn map_then_read_observes_the_frame() {
        let cursor = Cursor::new(TestPolicy, MapFrameStore::default());
        let alloc = BumpAllocator::new(0x1000);
        let root = alloc.allocate_frame().unwrap();
        let va = VirtAddr::new(0x4000);
        let frame = PhysAddr::new(0x9000);

        map_single(
            &cursor,
            &TestPolicy,
            &alloc,
            root,
            va,
            frame,
            PageFlags::READABLE | PageFlags::WRITABLE,
            CachingMode::WriteBack,
        )
        .unwrap();

        let pte = cursor.read_leaf(root, va).unwrap();
        assert!(TestPolicy.pte_page_present(pte));
        assert_eq!(TestPolicy.pte_page_address(pte), frame);
    }

    #[test]
    fn mapping_an_already_mapped_address_fails() {
        let cursor = Cursor::new(TestPolicy, MapFrameStore::default());
        let alloc = BumpAllocator::new(0x1000);
        let root = alloc.allocate_frame().unwrap();
        let va = VirtAddr::new(0x4000);

        map_single(
            &cursor,
            &TestPolicy,
            &alloc,
            root,
            va,
            PhysAddr::new(0x9000),
            PageFlags::READABLE,
            CachingMode::WriteBack,
        )
        .unwrap();

        let err = map_single(
            &cursor,
            &TestPolicy,
            &alloc,
            root,
            va,
            PhysAddr::new(0xA000),
            PageFlags::READABLE,
            CachingMode::WriteBack,
        )
        .unwrap_err();
        assert_eq!(err, Error::IllegalArgument);
    }

    #[test]
    fn unmap_clears_the_leaf_and_reports_prior_status() {
        let cursor = Cursor::new(TestPolicy, MapFrameStore::default());
        let alloc = BumpAllocator::new(0x1000);
        let root = alloc.allocate_frame().unwrap();
        let va = VirtAddr::new(0x8000);

        map_single(
            &cursor,
            &TestPolicy,
            &alloc,
            root,
            va,
            PhysAddr::new(0x9000),
            PageFlags::READABLE,
            CachingMode::WriteBack,
        )
        .unwrap();

        let status = unmap_single(&cursor, &TestPolicy, &alloc, root, va).unwrap();
        assert!(status.present);
        assert!(cursor.read_leaf(root, va).map(|p| p & 1 == 0).unwrap_or(true));
    }

    #[test]
    fn unmapping_an_unaligned_address_is_illegal_argument() {
        let cursor = Cursor::new(TestPolicy, MapFrameStore::default());
        let alloc = BumpAllocator::new(0x1000);
        let root = alloc.allocate_frame().unwrap();
        let err = unmap_single(&cursor, &TestPolicy, &alloc, root, VirtAddr::new(0x4001)).unwrap_err();
        assert_eq!(err, Error::IllegalArgument);
    }
}

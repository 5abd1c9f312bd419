/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Software doubles for this crate's HAL traits.
//!
//! Gated behind the `test-helpers` feature (rather than `#[cfg(test)]`) so
//! `nucleus`'s integration tests — which link `machine` as an ordinary
//! dependency, not as `machine`'s own test build — can reach the same
//! doubles its unit tests use, instead of re-deriving them per test file.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::page::{CachingMode, PageFlags, PageStatus};
use crate::percpu::CpuId;
use crate::sync::IrqSpinlock;
use crate::traits::{AlarmTracker, ClockSource, CursorPolicy, IpiSender, PhysicalAllocator, TlbInvalidate};
use crate::addr::PhysAddr;

/// A clock whose time is set directly by the test driving it, rather than
/// ticking on its own.
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn new(now_nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(now_nanos),
        }
    }

    pub fn set(&self, now_nanos: u64) {
        self.now.store(now_nanos, Ordering::SeqCst);
    }
}

impl ClockSource for TestClock {
    fn current_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// An alarm that only remembers the last deadline it was armed with, for
/// asserting what a `TimerEngine`/`DeadlineState` chose to arm.
#[derive(Default)]
pub struct TestAlarm {
    armed: IrqSpinlock<Option<u64>>,
}

impl TestAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed_deadline(&self) -> Option<u64> {
        self.armed.lock(|d| *d)
    }
}

impl AlarmTracker for TestAlarm {
    fn arm(&self, deadline_nanos: u64) {
        self.armed.lock(|d| *d = Some(deadline_nanos));
    }

    fn disarm(&self) {
        self.armed.lock(|d| *d = None);
    }
}

/// A `TlbInvalidate` that does nothing, for callers that need a collaborator
/// but never inspect what it received.
pub struct NoopTlb;

impl TlbInvalidate for NoopTlb {
    fn invalidate_range(&self, _slot: usize, _va: crate::addr::VirtAddr, _len: usize) {}
    fn invalidate_slot(&self, _slot: usize) {}
}

/// A `TlbInvalidate` that records every call, for asserting exactly which
/// ranges or slots were flushed.
#[derive(Default)]
pub struct RecordingTlb {
    ranges: IrqSpinlock<Vec<(usize, crate::addr::VirtAddr, usize)>>,
    full: IrqSpinlock<Vec<usize>>,
}

impl RecordingTlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> Vec<(usize, crate::addr::VirtAddr, usize)> {
        self.ranges.lock(|r| r.clone())
    }

    pub fn full_flushes(&self) -> Vec<usize> {
        self.full.lock(|f| f.clone())
    }
}

impl TlbInvalidate for RecordingTlb {
    fn invalidate_range(&self, slot: usize, va: crate::addr::VirtAddr, len: usize) {
        self.ranges.lock(|r| r.push((slot, va, len)));
    }

    fn invalidate_slot(&self, slot: usize) {
        self.full.lock(|f| f.push(slot));
    }
}

/// An `IpiSender` that records every broadcast's target list.
#[derive(Default)]
pub struct RecordingIpi {
    broadcasts: IrqSpinlock<Vec<Vec<CpuId>>>,
}

impl RecordingIpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcasts(&self) -> Vec<Vec<CpuId>> {
        self.broadcasts.lock(|b| b.clone())
    }
}

impl IpiSender for RecordingIpi {
    fn send_shootdown_ipi(&self, targets: &[CpuId]) {
        self.broadcasts.lock(|b| b.push(targets.to_vec()));
    }
}

/// A minimal 2-level, 9-bits-per-level software page-table policy: 4 KiB
/// pages, present bit 0, table bit 1, dirty bit 2, frame address in bits
/// [12..52). Enough to exercise `Cursor`'s walk/allocate logic without a
/// real architecture behind it.
pub struct TestPageTablePolicy;

const PRESENT: u64 = 1 << 0;
const TABLE: u64 = 1 << 1;
const DIRTY: u64 = 1 << 2;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl CursorPolicy for TestPageTablePolicy {
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

/// A `BTreeMap`-backed frame store, standing in for the short-lived
/// physical window a real platform maps. `nucleus`'s `FrameStore` trait is
/// implemented against these raw `read`/`write` accessors rather than here,
/// since that trait is defined downstream of this crate.
#[derive(Default)]
pub struct MapFrameStore {
    entries: IrqSpinlock<BTreeMap<(u64, usize), u64>>,
}

impl MapFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, frame: PhysAddr, index: usize) -> u64 {
        self.entries.lock(|e| *e.get(&(frame.as_raw(), index)).unwrap_or(&0))
    }

    pub fn write(&self, frame: PhysAddr, index: usize, value: u64) {
        self.entries.lock(|e| {
            e.insert((frame.as_raw(), index), value);
        });
    }
}

/// A bump allocator handing out successive page frames starting at
/// construction time; frees are no-ops, matching the teacher's own
/// single-direction allocator used in host tests.
pub struct BumpAllocator {
    next: AtomicU64,
}

impl BumpAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl crate::traits::PhysicalAllocator for BumpAllocator {
    fn allocate_frame(&self) -> Option<PhysAddr> {
        let frame = self.next.fetch_add(crate::addr::PAGE_SIZE as u64, Ordering::SeqCst);
        Some(PhysAddr::new(frame))
    }

    fn free_frame(&self, _frame: PhysAddr) {}
}

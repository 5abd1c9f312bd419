/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The Universe: a process-like handle table (spec §6).
//!
//! Every other component hands out or consumes handles, so this is kept as
//! its own first-class module rather than folded into whichever subsystem
//! happens to create the first kind of descriptor (SPEC_FULL §2's ambient
//! addition).

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use machine::IrqSpinlock;

use crate::error::{Error, Result};
use crate::ipc::queue::IpcQueue;
use crate::ipc::stream::LaneHandle;
use crate::memory::page_space::PageSpace;

/// Opaque per-Universe handle identifier. Indices, not capabilities: this
/// core's Universe is the simple slot-map the spec calls for, not the
/// seL4-style derivation-tree CapTable a full capability kernel would need.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HandleId(u32);

impl HandleId {
    fn new(index: usize, generation: u32) -> Self {
        debug_assert!(index < (1 << 24));
        Self((generation << 24) | (index as u32 & 0x00FF_FFFF))
    }

    fn index(self) -> usize {
        (self.0 & 0x00FF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> 24
    }
}

/// A one-shot or bitset wait primitive. Neither is specified beyond its
/// name in spec §6; modelled as the minimal state other components need to
/// raise and observe them (`AlarmTracker`/WorkQueue completions raise
/// events, `queue_wait`-style syscalls observe them).
#[derive(Debug, Default)]
pub struct OneShotEvent {
    signalled: core::sync::atomic::AtomicBool,
}

impl OneShotEvent {
    pub fn raise(&self) {
        self.signalled
            .store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(core::sync::atomic::Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct BitsetEvent {
    bits: core::sync::atomic::AtomicU64,
}

impl BitsetEvent {
    pub fn raise(&self, mask: u64) {
        self.bits
            .fetch_or(mask, core::sync::atomic::Ordering::AcqRel);
    }

    pub fn take(&self) -> u64 {
        self.bits.swap(0, core::sync::atomic::Ordering::AcqRel)
    }
}

/// A region of physical memory mapped into one or more address spaces.
/// Ownership of the backing frames lives with the `PhysicalAllocator`
/// (spec §3); the view only records size and a stable identity.
#[derive(Debug)]
pub struct MemoryView {
    pub size_bytes: usize,
}

/// Placeholder for the Thread/Fiber contract surface (spec §3: "not fully
/// specified here, it is a large sub-component"). Only the handful of
/// fields the core's own components read are modelled.
#[derive(Debug)]
pub struct ThreadHandleData {
    pub cpu_affinity: Option<machine::CpuId>,
}

#[derive(Debug)]
pub struct IrqObject {
    pub pin: u32,
    pub sequence: core::sync::atomic::AtomicU64,
}

#[derive(Debug)]
pub struct IoSpace {
    pub ports: alloc::vec::Vec<core::ops::Range<u16>>,
}

#[derive(Debug)]
pub struct CredentialsToken {
    pub blob: alloc::vec::Vec<u8>,
}

/// Any object a Universe can name. One variant per descriptor kind listed
/// in spec §6.
pub enum Descriptor {
    MemoryView(Arc<MemoryView>),
    AddressSpace(Arc<PageSpace>),
    Thread(Arc<ThreadHandleData>),
    Lane(LaneHandle),
    IpcQueue(Arc<IpcQueue>),
    Irq(Arc<IrqObject>),
    OneShotEvent(Arc<OneShotEvent>),
    BitsetEvent(Arc<BitsetEvent>),
    IoSpace(Arc<IoSpace>),
    /// An opaque reference to some other kernel object not named above
    /// (e.g. a raw capability to the Universe itself, for `handle_duplicate`
    /// chains that cross Universes).
    KernelObject(Arc<()>),
    CredentialsToken(Arc<CredentialsToken>),
}

impl Clone for Descriptor {
    fn clone(&self) -> Self {
        match self {
            Descriptor::MemoryView(v) => Descriptor::MemoryView(v.clone()),
            Descriptor::AddressSpace(v) => Descriptor::AddressSpace(v.clone()),
            Descriptor::Thread(v) => Descriptor::Thread(v.clone()),
            Descriptor::Lane(v) => Descriptor::Lane(v.clone()),
            Descriptor::IpcQueue(v) => Descriptor::IpcQueue(v.clone()),
            Descriptor::Irq(v) => Descriptor::Irq(v.clone()),
            Descriptor::OneShotEvent(v) => Descriptor::OneShotEvent(v.clone()),
            Descriptor::BitsetEvent(v) => Descriptor::BitsetEvent(v.clone()),
            Descriptor::IoSpace(v) => Descriptor::IoSpace(v.clone()),
            Descriptor::KernelObject(v) => Descriptor::KernelObject(v.clone()),
            Descriptor::CredentialsToken(v) => Descriptor::CredentialsToken(v.clone()),
        }
    }
}

enum Slot {
    Occupied { generation: u32, descriptor: Descriptor },
    Free { generation: u32, next_free: Option<usize> },
}

struct Table {
    slots: Vec<Slot>,
    next_free: Option<usize>,
}

/// A process-like handle table: `HandleId -> Descriptor` (spec §6).
///
/// Backed by a generation-tagged slot array instead of the teacher's
/// derivation-tree `CapTable` (`examples/metta-systems-vesper/nucleus/src/
/// caps/captable.rs`) — this spec asks only for attach/detach/lookup/
/// duplicate on a flat table, not capability derivation and revocation.
pub struct Universe {
    table: IrqSpinlock<Table>,
}

impl Universe {
    pub fn new() -> Self {
        Self {
            table: IrqSpinlock::new(Table {
                slots: Vec::new(),
                next_free: None,
            }),
        }
    }

    /// Inserts `descriptor`, returning a fresh handle.
    pub fn attach(&self, descriptor: Descriptor) -> HandleId {
        self.table.lock(|t| {
            if let Some(index) = t.next_free {
                let (generation, next_free) = match &t.slots[index] {
                    Slot::Free { generation, next_free } => (*generation, *next_free),
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                t.next_free = next_free;
                t.slots[index] = Slot::Occupied { generation, descriptor };
                HandleId::new(index, generation)
            } else {
                let index = t.slots.len();
                t.slots.push(Slot::Occupied {
                    generation: 0,
                    descriptor,
                });
                HandleId::new(index, 0)
            }
        })
    }

    /// Removes and returns the descriptor behind `handle`. Fails with
    /// `IllegalArgument` if the handle is stale or unknown.
    pub fn detach(&self, handle: HandleId) -> Result<Descriptor> {
        self.table.lock(|t| {
            let index = handle.index();
            match t.slots.get(index) {
                Some(Slot::Occupied { generation, .. }) if *generation == handle.generation() => {
                    let next_free = t.next_free;
                    let Slot::Occupied { generation, descriptor } = core::mem::replace(
                        &mut t.slots[index],
                        Slot::Free {
                            generation: generation.wrapping_add(1),
                            next_free,
                        },
                    ) else {
                        unreachable!()
                    };
                    let _ = generation;
                    t.next_free = Some(index);
                    Ok(descriptor)
                }
                _ => Err(Error::IllegalArgument),
            }
        })
    }

    /// Returns a clone of the descriptor behind `handle` without removing
    /// it.
    pub fn lookup(&self, handle: HandleId) -> Result<Descriptor> {
        self.table.lock(|t| match t.slots.get(handle.index()) {
            Some(Slot::Occupied { generation, descriptor }) if *generation == handle.generation() => {
                Ok(descriptor.clone())
            }
            _ => Err(Error::IllegalArgument),
        })
    }

    /// Inserts a fresh handle referencing the same underlying object as
    /// `handle` (`handle_duplicate` in spec §6).
    pub fn duplicate(&self, handle: HandleId) -> Result<HandleId> {
        let descriptor = self.lookup(handle)?;
        Ok(self.attach(descriptor))
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

//! Architecture-neutral hardware abstraction layer.
//!
//! This crate carries no policy of its own: it defines the address
//! newtypes, page attribute flags, per-CPU slot array, and the trait
//! contracts (`PhysicalAllocator`, `ClockSource`, `AlarmTracker`,
//! `CursorPolicy`) that `nucleus` is generic over. A real platform
//! implements the traits against its hardware; host-side tests implement
//! them in software.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms)]

pub mod addr;
pub mod page;
pub mod percpu;
pub mod sync;
#[cfg(feature = "test-helpers")]
pub mod test_support;
pub mod traits;

pub use addr::{PhysAddr, VirtAddr, VirtRange, PAGE_SHIFT, PAGE_SIZE};
pub use page::{CachingMode, PageFlags, PageStatus};
pub use percpu::{CpuId, PerCpu};
pub use sync::{Interrupts, IrqSpinlock, NoInterruptControl};
pub use traits::{
    AlarmTracker, ClockSource, CursorPolicy, IpiSender, PageTableWalker, PhysicalAllocator,
    TlbInvalidate,
};

/// Version string, kept from the teacher for parity with the rest of the
/// boot-time diagnostics a real platform prints.
pub fn version() -> &'static str {
    concat!(
        env!("CARGO_PKG_NAME"),
        " version ",
        env!("CARGO_PKG_VERSION")
    )
}

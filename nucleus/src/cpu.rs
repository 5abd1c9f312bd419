/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! One CPU's aggregate state, passed by reference everywhere instead of
//! read out of a global (spec §9 design notes: "Express as explicit
//! `System` context passed by reference into the core... instead of
//! singletons for physical allocator, kernel page space, RCU engine, and
//! CPU data arrays").
//!
//! `PageSpace` and `LoadBalancer` stay genuinely global (a `PageSpace` is
//! shared by every CPU that has it bound; the load balancer reasons about
//! every CPU's estimate at once) — only the state that is meaningfully
//! *this CPU's own* lives here: its ASID bindings, its combined timer/
//! preemption deadline, and its work queue.

extern crate alloc;

use alloc::boxed::Box;

use machine::{AlarmTracker, CpuId, IrqSpinlock};

use crate::memory::page_space::AsidCpuData;
use crate::sched::deadline::DeadlineState;
use crate::sched::workqueue::WorkQueue;
use crate::timer::TimerEngine;

/// Per-CPU state: ASID bindings, the combined deadline, and the work
/// queue. `'a` is the lifetime of the hardware collaborators (clock, alarm)
/// this CPU's `TimerEngine`/`DeadlineState` borrow.
pub struct CpuData<'a> {
    pub id: CpuId,
    asid: IrqSpinlock<AsidCpuData>,
    pub deadline: DeadlineState<'a>,
    pub workqueue: WorkQueue,
}

impl<'a> CpuData<'a> {
    pub fn new(
        id: CpuId,
        asid_slots: usize,
        timer: TimerEngine<'a>,
        alarm: &'a dyn AlarmTracker,
        wake: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            id,
            asid: IrqSpinlock::new(AsidCpuData::new(asid_slots)),
            deadline: DeadlineState::new(timer, alarm),
            workqueue: WorkQueue::new(wake),
        }
    }

    /// Runs `f` with exclusive access to this CPU's ASID bindings. IRQ-off
    /// for the duration: the shootdown IPI handler reaches the same
    /// bindings from interrupt context on this CPU (spec §5 shared-resource
    /// policy).
    pub fn with_asid<R>(&self, f: impl FnOnce(&mut AsidCpuData) -> R) -> R {
        self.asid.lock(f)
    }
}

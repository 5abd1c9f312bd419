/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Combines a CPU's [`TimerEngine`](crate::timer::TimerEngine) deadline with
//! the scheduler's preemption deadline onto the one hardware alarm the CPU
//! actually has (SPEC_FULL §4.4 supplement).
//!
//! Grounded on `original_source/kernel/thor/generic/timer.cpp`'s
//! `updateDeadline_` / `setPreemptionDeadline` / `handleTimerInterrupt`:
//! distilled spec.md only says "deadlines are combined per-CPU", which
//! isn't implementable on its own without this recombination step.

extern crate alloc;

use machine::AlarmTracker;

use crate::timer::{Completion, TimerEngine, TimerHandle};

/// Per-CPU state multiplexing timer deadlines and the scheduler's
/// preemption deadline onto one alarm.
pub struct DeadlineState<'a> {
    timer: TimerEngine<'a>,
    alarm: &'a dyn AlarmTracker,
    preemption_deadline: machine::IrqSpinlock<Option<u64>>,
}

impl<'a> DeadlineState<'a> {
    pub fn new(timer: TimerEngine<'a>, alarm: &'a dyn AlarmTracker) -> Self {
        Self {
            timer,
            alarm,
            preemption_deadline: machine::IrqSpinlock::new(None),
        }
    }

    pub fn install_timer(&self, deadline_nanos: u64, completion: Completion) -> TimerHandle {
        let handle = self.timer.install(deadline_nanos, completion);
        self.recombine();
        handle
    }

    pub fn cancel_timer(&self, handle: TimerHandle) {
        self.timer.cancel(handle);
        self.recombine();
    }

    /// Sets (or clears, with `None`) the scheduler's preemption deadline —
    /// "this thread's quantum expires at T".
    pub fn set_preemption_deadline(&self, deadline_nanos: Option<u64>) {
        self.preemption_deadline.lock(|d| *d = deadline_nanos);
        self.recombine();
    }

    fn recombine(&self) {
        let preemption = self.preemption_deadline.lock(|d| *d);
        match (self.timer.next_deadline(), preemption) {
            (Some(a), Some(b)) => self.alarm.arm(a.min(b)),
            (Some(a), None) => self.alarm.arm(a),
            (None, Some(b)) => self.alarm.arm(b),
            (None, None) => self.alarm.disarm(),
        }
    }

    /// Runs on the hardware alarm IRQ. Fires any due timers and, if the
    /// preemption deadline has also passed, clears it and returns `true`
    /// so the caller knows to reschedule.
    pub fn handle_timer_interrupt(&self, now_nanos: u64) -> bool {
        let preempted = self.preemption_deadline.lock(|d| match *d {
            Some(deadline) if deadline <= now_nanos => {
                *d = None;
                true
            }
            _ => false,
        });
        self.timer.progress();
        self.recombine();
        preempted
    }
}

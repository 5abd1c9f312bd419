/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The RCU engine (spec §4.5, §9): safe reclamation of page-table frames
//! (and anything else) after every CPU has passed through a schedulable
//! point.
//!
//! Grounded on `original_source/kernel/thor/generic/rcu.cpp`: the barrier
//! is not a plain counter, it is a sequence-number state machine
//! (`state_: seq | busy-bit`) so that two concurrent `barrier()` callers
//! don't each schedule their own round of probes and double-count
//! quiescent CPUs — whichever caller observes the busy bit already set
//! just waits for the in-flight round to reach (at least) its own target
//! generation.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use machine::{CpuId, IrqSpinlock, PerCpu};

/// A deferred callback, to run once the barrier it was registered under
/// completes (`submit_rcu` in spec §4.5).
type Callback = Box<dyn FnOnce() + Send>;

struct PendingCallback {
    /// The generation this callback becomes runnable after.
    generation: u64,
    callback: Callback,
}

/// Per-CPU observed generation, plus the global target and busy bit.
///
/// `state` packs the busy bit into bit 0 and the target generation into
/// the remaining bits, matching the source's combined `seq | busy-bit`
/// word: a single atomic CAS both claims "I will drive this round" and
/// publishes the new target.
pub struct RcuEngine<const NCPU: usize> {
    state: AtomicU64,
    observed: PerCpu<AtomicU64, NCPU>,
    callbacks: IrqSpinlock<Vec<PendingCallback>>,
}

const BUSY_BIT: u64 = 1;

impl<const NCPU: usize> RcuEngine<NCPU> {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            observed: PerCpu::new(core::array::from_fn(|_| AtomicU64::new(0))),
            callbacks: IrqSpinlock::new(Vec::new()),
        }
    }

    fn target_generation(state: u64) -> u64 {
        state >> 1
    }

    fn is_busy(state: u64) -> bool {
        state & BUSY_BIT != 0
    }

    /// Called by a CPU's WorkQueue probe (or, in host tests, directly) to
    /// record that `cpu` has passed through a schedulable point.
    ///
    /// Returns the set of callbacks now runnable, for the caller to invoke
    /// outside any lock this module holds.
    pub fn quiesce(&self, cpu: CpuId, all_cpus: &[CpuId]) -> Vec<Callback> {
        let state = self.state.load(Ordering::Acquire);
        let target = Self::target_generation(state);
        self.observed[cpu].store(target, Ordering::Release);

        if all_cpus.iter().all(|&c| self.observed[c].load(Ordering::Acquire) >= target) {
            // Every CPU has caught up to `target`: the round is done, clear
            // the busy bit (only if no newer round has been started while we
            // were counting) and harvest due callbacks.
            let _ = self.state.compare_exchange(
                state,
                target << 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            self.callbacks.lock(|cbs| {
                let mut due = Vec::new();
                let mut i = 0;
                while i < cbs.len() {
                    if cbs[i].generation <= target {
                        due.push(cbs.remove(i));
                    } else {
                        i += 1;
                    }
                }
                due.into_iter().map(|e| e.callback).collect()
            })
        } else {
            Vec::new()
        }
    }

    /// Requests a new barrier round reach at least `current_generation()
    /// + 1`. Returns the generation this call's completion depends on; the
    /// caller (the scheduler glue) is responsible for scheduling a probe
    /// onto every CPU's WorkQueue that calls `quiesce`, but only if this
    /// call is the one that actually advanced the target (others piggyback
    /// on the in-flight round).
    pub fn request_barrier(&self) -> (u64, bool) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let target = Self::target_generation(state);
            if Self::is_busy(state) {
                // A round is already in flight; our callers' completion
                // condition is satisfied by it reaching at least `target`.
                return (target, false);
            }
            let new_target = target + 1;
            let new_state = (new_target << 1) | BUSY_BIT;
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (new_target, true);
            }
        }
    }

    /// Registers `callback` to run once a barrier reaching `generation`
    /// has completed (`submit_rcu`).
    pub fn submit_rcu(&self, generation: u64, callback: Callback) {
        self.callbacks
            .lock(|cbs| cbs.push(PendingCallback { generation, callback }));
    }

    pub fn current_generation(&self) -> u64 {
        Self::target_generation(self.state.load(Ordering::Acquire))
    }
}

impl<const NCPU: usize> Default for RcuEngine<NCPU> {
    fn default() -> Self {
        Self::new()
    }
}

/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The per-CPU `TimerEngine` (spec §4.4): a deadline priority queue
//! multiplexed onto one hardware one-shot alarm.
//!
//! Grounded on `original_source/kernel/thor/generic/timer.cpp`. Cancelled
//! or already-fired heap entries are removed from the node table but left
//! in the `BinaryHeap` itself (lazy deletion, the standard trick for a
//! heap without efficient arbitrary removal); `progress()` skips any
//! popped entry whose node is no longer present.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BinaryHeap};
use core::cmp::Ordering as CmpOrdering;

use machine::{AlarmTracker, ClockSource};

use crate::error::Error;

pub type Completion = Box<dyn FnOnce(Result<(), Error>) + Send>;

struct Node {
    deadline_nanos: u64,
    completion: Completion,
}

#[derive(Eq, PartialEq)]
struct HeapEntry {
    deadline_nanos: u64,
    id: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // highest (spec §3: "the heap's minimum deadline equals the
        // hardware alarm setting").
        other
            .deadline_nanos
            .cmp(&self.deadline_nanos)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<HeapEntry>,
    nodes: BTreeMap<u64, Node>,
    next_id: u64,
}

/// An identifier for an installed timer, used to `cancel` it later.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(u64);

/// Per-CPU deadline priority queue backed by one hardware one-shot alarm
/// (spec §3/§4.4).
pub struct TimerEngine<'a> {
    state: machine::IrqSpinlock<State>,
    alarm: &'a dyn AlarmTracker,
    clock: &'a dyn ClockSource,
}

impl<'a> TimerEngine<'a> {
    pub fn new(alarm: &'a dyn AlarmTracker, clock: &'a dyn ClockSource) -> Self {
        Self {
            state: machine::IrqSpinlock::new(State {
                heap: BinaryHeap::new(),
                nodes: BTreeMap::new(),
                next_id: 0,
            }),
            alarm,
            clock,
        }
    }

    /// Registers `completion` to run at `deadline_nanos` (spec §4.4
    /// `install`). If `deadline_nanos` is already in the past, the
    /// deadline still fires on the next `progress()` call — §8's boundary
    /// behaviour "deadline already in the past at install time" is not a
    /// special case, just an immediately-due one.
    pub fn install(&self, deadline_nanos: u64, completion: Completion) -> TimerHandle {
        self.state.lock(|state| {
            let id = state.next_id;
            state.next_id += 1;
            state.nodes.insert(id, Node { deadline_nanos, completion });
            state.heap.push(HeapEntry { deadline_nanos, id });

            let is_new_min = state
                .heap
                .peek()
                .map(|top| top.id == id)
                .unwrap_or(false);
            if is_new_min {
                self.alarm.arm(deadline_nanos);
            }
            TimerHandle(id)
        })
    }

    /// Peeks the earliest still-queued deadline without firing or removing
    /// anything. Used by [`crate::sched::deadline::DeadlineState`] to
    /// combine this engine's deadline with the scheduler's preemption
    /// deadline onto one hardware alarm.
    pub fn next_deadline(&self) -> Option<u64> {
        self.state.lock(|state| state.heap.peek().map(|top| top.deadline_nanos))
    }

    /// Cancels a timer if it is still queued (spec §4.4 `cancel`).
    /// Idempotent: cancelling an already-fired or already-cancelled handle
    /// is a no-op (spec P5).
    pub fn cancel(&self, handle: TimerHandle) {
        let node = self.state.lock(|state| state.nodes.remove(&handle.0));
        if let Some(node) = node {
            (node.completion)(Err(Error::Cancelled));
        }
    }

    /// Runs on the hardware alarm IRQ (spec §4.4 `progress`): fires every
    /// due timer, then reprograms the alarm for the new minimum, looping
    /// once more if arming raced a deadline that has already passed.
    pub fn progress(&self) {
        loop {
            let mut due = alloc::vec::Vec::new();
            let next_deadline = self.state.lock(|state| {
                let now = self.clock.current_nanos();
                loop {
                    match state.heap.peek() {
                        Some(top) if top.deadline_nanos <= now => {
                            let entry = state.heap.pop().unwrap();
                            if let Some(node) = state.nodes.remove(&entry.id) {
                                due.push(node.completion);
                            }
                            // else: lazily-deleted (already cancelled/fired)
                            // entry, skip silently.
                        }
                        _ => break,
                    }
                }
                state.heap.peek().map(|top| top.deadline_nanos)
            });

            for completion in due {
                completion(Ok(()));
            }

            match next_deadline {
                None => {
                    self.alarm.disarm();
                    return;
                }
                Some(deadline) => {
                    self.alarm.arm(deadline);
                    if self.clock.current_nanos() < deadline {
                        return;
                    }
                    // Arming raced a deadline that has already passed; loop
                    // to drain it (spec §4.4 step 5).
                }
            }
        }
    }
}

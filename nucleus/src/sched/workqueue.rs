/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! A serial FIFO queue of closures, one per CPU and one per fiber (spec
//! §4.5): "running the queue executes items in FIFO order on the owning
//! context. Submission from another CPU enqueues and wakes."
//!
//! Grounded on the teacher's own `IrqSpinlock`-protected queue shape (see
//! `nucleus::memory::page_space`'s shootdown FIFO) generalized to carry
//! arbitrary work instead of shootdown requests; `wake` plays the role the
//! source's IPI does when the submitter is a different CPU.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;

pub type WorkItem = Box<dyn FnOnce() + Send>;

/// A FIFO of closures, drained by its owning context (a CPU's idle loop, or
/// a fiber resuming). `wake` is called once per `submit` so a submitter on
/// another CPU can prod the owner out of an idle/halt state; running the
/// queue itself never calls it.
pub struct WorkQueue {
    items: machine::IrqSpinlock<VecDeque<WorkItem>>,
    wake: Box<dyn Fn() + Send + Sync>,
}

impl WorkQueue {
    pub fn new(wake: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            items: machine::IrqSpinlock::new(VecDeque::new()),
            wake,
        }
    }

    /// Enqueues `item` and wakes the owning context.
    pub fn submit(&self, item: WorkItem) {
        self.items.lock(|q| q.push_back(item));
        (self.wake)();
    }

    /// Runs every item currently queued, in FIFO order, including items
    /// submitted by a running item itself (the owning context drains the
    /// queue to empty rather than taking a fixed snapshot, matching a real
    /// scheduler's "keep running the queue until it's quiet" idle loop).
    pub fn run(&self) {
        loop {
            let next = self.items.lock(|q| q.pop_front());
            match next {
                Some(item) => item(),
                None => return,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock(|q| q.is_empty())
    }
}

/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Spinlock primitives for data shared between CPUs and interrupt handlers.
//!
//! The original teaching-only [`NullLock`] punted on real mutual exclusion
//! because it only ever ran on one core with interrupts disabled. The core
//! this crate backs runs on several CPUs at once (§5: "IRQ-disabling
//! spinlocks protect every in-kernel data structure"), so the lock itself
//! has to do real work; `IrqSpinlock` below is what `NullLock` grows into
//! once that assumption no longer holds.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Synchronization interfaces.
pub mod interface {
    /// Any object implementing this trait guarantees exclusive access to the data wrapped within
    /// the Mutex for the duration of the provided closure.
    pub trait Mutex {
        /// The type of the data that is wrapped by this mutex.
        type Data;

        /// Locks the mutex and grants the closure temporary mutable access to the wrapped data.
        fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R;
    }
}

/// Disables and restores interrupt delivery on the current CPU. Supplied by
/// the platform; the core never touches interrupt controller registers
/// directly.
pub trait Interrupts {
    /// Opaque saved interrupt state, restored by `restore`.
    type State: Copy;

    fn disable() -> Self::State;
    fn restore(state: Self::State);
    fn are_enabled() -> bool;
}

/// An `Interrupts` impl that never disables anything — for host-side tests
/// where there is no interrupt controller to model.
pub struct NoInterruptControl;

impl Interrupts for NoInterruptControl {
    type State = ();
    fn disable() -> Self::State {}
    fn restore(_state: Self::State) {}
    fn are_enabled() -> bool {
        true
    }
}

/// A test-and-test-and-set spinlock that disables interrupts on the current
/// CPU for the lock's lifetime, matching the "IRQ-off spinlock" policy §5
/// mandates for PageSpace FIFOs, Stream process queues and the TimerEngine
/// heap.
///
/// `I` is the interrupt-control policy; callers pick it per build (a real
/// `Interrupts` impl in the kernel, [`NoInterruptControl`] in host tests).
pub struct IrqSpinlock<T, I: Interrupts = NoInterruptControl> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    _marker: core::marker::PhantomData<I>,
}

unsafe impl<T: Send, I: Interrupts> Send for IrqSpinlock<T, I> {}
unsafe impl<T: Send, I: Interrupts> Sync for IrqSpinlock<T, I> {}

impl<T, I: Interrupts> IrqSpinlock<T, I> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _marker: core::marker::PhantomData,
        }
    }

    fn acquire(&self) -> I::State {
        let irq_state = I::disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        irq_state
    }

    /// Acquires the lock with interrupts disabled, runs `f` with exclusive
    /// access, then releases the lock and restores the interrupt state.
    ///
    /// Matches the shape every algorithm in spec §4.1/§4.2/§4.4 is written
    /// against ("enter the FIFO mutex with IRQs off ... leave the mutex").
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let irq_state = self.acquire();
        let result = f(unsafe { &mut *self.data.get() });
        self.locked.store(false, Ordering::Release);
        I::restore(irq_state);
        result
    }

    /// Like [`lock`](Self::lock), but returns a RAII guard instead of taking
    /// a closure — convenient when the critical section needs early
    /// returns. Interrupts stay disabled for as long as the guard lives.
    pub fn lock_guard(&self) -> IrqSpinlockGuard<'_, T, I> {
        let irq_state = self.acquire();
        IrqSpinlockGuard {
            lock: self,
            irq_state: Some(irq_state),
        }
    }

    /// Racy by construction; only useful for assertions.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T, I: Interrupts> interface::Mutex for IrqSpinlock<T, I> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        IrqSpinlock::lock(self, f)
    }
}

pub struct IrqSpinlockGuard<'a, T, I: Interrupts> {
    lock: &'a IrqSpinlock<T, I>,
    irq_state: Option<I::State>,
}

impl<'a, T, I: Interrupts> Deref for IrqSpinlockGuard<'a, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T, I: Interrupts> DerefMut for IrqSpinlockGuard<'a, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T, I: Interrupts> Drop for IrqSpinlockGuard<'a, T, I> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if let Some(state) = self.irq_state.take() {
            I::restore(state);
        }
    }
}

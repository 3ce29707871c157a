//! Counting semaphore with FIFO wakeups.

use crate::arch::{Arch, InterruptGuard};
use crate::kernel::Kernel;
use crate::mem::{PageAllocator, PagePool};
use crate::sched::{FifoScheduler, Scheduler};
use crate::thread::{ReadyLink, ThreadList};
use spin::Mutex;

struct SemaphoreInner {
    value: u32,
    /// Threads blocked in `down`, oldest first
    waiters: ThreadList<ReadyLink>,
}

/// Counting semaphore bound to a kernel.
///
/// `down` blocks while the value is zero; `up` wakes the longest waiter.
/// A woken waiter competes again for the value, so another thread that
/// calls `down` first may take it.
pub struct Semaphore<'k, A: Arch, S: Scheduler = FifoScheduler, P: PageAllocator = PagePool> {
    kernel: &'k Kernel<A, S, P>,
    inner: Mutex<SemaphoreInner>,
}

impl<'k, A: Arch, S: Scheduler, P: PageAllocator> Semaphore<'k, A, S, P> {
    pub const fn new(kernel: &'k Kernel<A, S, P>, value: u32) -> Self {
        Self {
            kernel,
            inner: Mutex::new(SemaphoreInner {
                value,
                waiters: ThreadList::new(),
            }),
        }
    }

    pub fn kernel(&self) -> &'k Kernel<A, S, P> {
        self.kernel
    }

    /// Wait until the value is positive, then decrement it.
    ///
    /// # Panics
    ///
    /// If called from an interrupt handler.
    pub fn down(&self) {
        assert!(!A::in_interrupt(), "semaphore down in an interrupt handler");

        let _irq = InterruptGuard::<A>::new();
        loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            inner.waiters.push_back(self.kernel.current());
            drop(inner);
            self.kernel.block();
        }
    }

    /// Decrement the value if it is positive, without blocking.
    pub fn try_down(&self) -> bool {
        let _irq = InterruptGuard::<A>::new();
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the value and wake the longest waiter. Never blocks and
    /// never switches threads; usable from interrupt handlers.
    pub fn up(&self) {
        let _irq = InterruptGuard::<A>::new();
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiters.pop_front() {
            self.kernel.unblock(waiter);
        }
        inner.value += 1;
    }

    /// Current value.
    pub fn value(&self) -> u32 {
        let _irq = InterruptGuard::<A>::new();
        self.inner.lock().value
    }

    /// Number of threads waiting in `down`.
    pub fn waiters(&self) -> usize {
        let _irq = InterruptGuard::<A>::new();
        self.inner.lock().waiters.len()
    }
}


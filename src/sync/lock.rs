//! Non-recursive sleeping lock with an owner.

use super::semaphore::Semaphore;
use crate::arch::{Arch, InterruptGuard};
use crate::kernel::Kernel;
use crate::mem::{PageAllocator, PagePool};
use crate::sched::{FifoScheduler, Scheduler};
use crate::thread::ThreadRef;
use spin::Mutex;

/// Mutual exclusion between threads, built on a binary semaphore.
///
/// Only the holder may release it, and the holder may not acquire it
/// again. Contenders sleep rather than spin.
pub struct Lock<'k, A: Arch, S: Scheduler = FifoScheduler, P: PageAllocator = PagePool> {
    semaphore: Semaphore<'k, A, S, P>,
    holder: Mutex<Option<ThreadRef>>,
}

impl<'k, A: Arch, S: Scheduler, P: PageAllocator> Lock<'k, A, S, P> {
    pub const fn new(kernel: &'k Kernel<A, S, P>) -> Self {
        Self {
            semaphore: Semaphore::new(kernel, 1),
            holder: Mutex::new(None),
        }
    }

    /// Take the lock, sleeping until it is free.
    ///
    /// # Panics
    ///
    /// If called from an interrupt handler or by the current holder.
    pub fn acquire(&self) {
        assert!(!A::in_interrupt(), "lock acquire in an interrupt handler");
        assert!(
            !self.held_by_current_thread(),
            "lock already held by current thread"
        );

        self.semaphore.down();
        self.set_holder(Some(self.semaphore.kernel().current()));
    }

    /// Take the lock if it is free, without sleeping.
    ///
    /// # Panics
    ///
    /// If called from an interrupt handler or by the current holder.
    pub fn try_acquire(&self) -> bool {
        assert!(!A::in_interrupt(), "lock acquire in an interrupt handler");
        assert!(
            !self.held_by_current_thread(),
            "lock already held by current thread"
        );

        if self.semaphore.try_down() {
            self.set_holder(Some(self.semaphore.kernel().current()));
            true
        } else {
            false
        }
    }

    /// Give the lock up and wake the next waiter.
    ///
    /// # Panics
    ///
    /// If the current thread does not hold it.
    pub fn release(&self) {
        assert!(
            self.held_by_current_thread(),
            "current thread does not hold the lock"
        );
        self.set_holder(None);
        self.semaphore.up();
    }

    pub fn held_by_current_thread(&self) -> bool {
        let _irq = InterruptGuard::<A>::new();
        *self.holder.lock() == Some(self.semaphore.kernel().current())
    }

    pub fn holder(&self) -> Option<ThreadRef> {
        let _irq = InterruptGuard::<A>::new();
        *self.holder.lock()
    }

    fn set_holder(&self, holder: Option<ThreadRef>) {
        let _irq = InterruptGuard::<A>::new();
        *self.holder.lock() = holder;
    }
}

//! Test helper utilities and common functionality.

use crate::arch::host::{self, HostArch};
use crate::kernel::Kernel;
use crate::mem::PagePool;
use crate::sched::FifoScheduler;
use crate::sync::{Lock, Semaphore};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub(crate) type TestKernel = Kernel<HostArch>;
pub(crate) type TestSemaphore = Semaphore<'static, HostArch>;
pub(crate) type TestLock = Lock<'static, HostArch>;

/// Boot a simulated CPU on the calling thread and make it the main
/// thread of a fresh kernel.
pub(crate) fn boot_kernel() -> &'static TestKernel {
    boot_kernel_with(PagePool::new())
}

pub(crate) fn boot_kernel_with(pages: PagePool) -> &'static TestKernel {
    host::boot();
    let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new(FifoScheduler::new(), pages)));
    kernel.init();
    kernel
}

pub(crate) fn semaphore(kernel: &'static TestKernel, value: u32) -> &'static TestSemaphore {
    Box::leak(Box::new(Semaphore::new(kernel, value)))
}

pub(crate) fn lock(kernel: &'static TestKernel) -> &'static TestLock {
    Box::leak(Box::new(Lock::new(kernel)))
}

/// Yield from the main thread until only `remaining` threads are alive.
pub(crate) fn run_until_count(kernel: &'static TestKernel, remaining: usize) {
    while kernel.thread_count() > remaining {
        kernel.yield_now();
    }
}

/// Ordered record of events shared between threads.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<&'static str>>>);

impl EventLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, event: &'static str) {
        self.0.lock().push(event);
    }

    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

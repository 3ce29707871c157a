#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! Kernel threads for a single-core bare-metal Raspberry Pi.
//!
//! This library is the threading core of a small AArch64 kernel: thread
//! control blocks living in one page with their stack, a FIFO ready
//! queue, preemption from the ARM generic timer, and sleeping semaphores
//! and locks.
//!
//! # Target Platform
//!
//! - **Hardware**: Raspberry Pi 3/Zero 2 W class boards, or QEMU `virt`
//! - **Architecture**: AArch64, EL1, one core
//! - **Environment**: Bare-metal (no operating system)
//!
//! # Features
//!
//! - `std-shim`: simulated CPU on the host, for running the kernel in
//!   ordinary processes
//! - `qemu-virt`: peripheral addresses of the QEMU `virt` machine
//!
//! # Quick Start
//!
//! ```ignore
//! use rpi_kthreads::{DefaultArch, FifoScheduler, Kernel, PagePool};
//!
//! static KERNEL: Kernel<DefaultArch> = Kernel::new(FifoScheduler::new(), PagePool::new());
//!
//! fn worker(n: usize) {
//!     log::info!("worker {} on thread {}", n, KERNEL.current_id());
//! }
//!
//! fn kernel_main() -> ! {
//!     // interrupts are still masked from boot
//!     KERNEL.init();
//!     KERNEL.start_preemption();
//!
//!     KERNEL.create("worker", 31, worker, 1).expect("out of pages");
//!     KERNEL.exit()
//! }
//! ```
//!
//! # Architecture
//!
//! - [`arch`]: interrupt control, the switch leaf and the IRQ boundary
//! - [`thread`]: TCB layout, ids, states and intrusive thread lists
//! - [`sched`]: the ready-queue policy
//! - [`kernel`]: lifecycle operations and the switch protocol
//! - [`sync`]: semaphores and locks

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod sync;
pub mod thread;

#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod console;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr daifset, #0xf", options(nomem, nostack));
    }

    #[cfg(target_arch = "aarch64")]
    {
        match info.location() {
            Some(location) => {
                crate::pl011_println!("KERNEL PANIC at {}:{}", location.file(), location.line())
            }
            None => crate::pl011_println!("KERNEL PANIC"),
        }
        crate::pl011_println!("{}", info.message());
        arch::aarch64_boot::halt()
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = info;
        loop {}
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, Context, DefaultArch, InterruptGuard, InterruptLevel, TickHandler};

// Kernel
pub use kernel::{Kernel, KernelStats};

// Scheduler
pub use sched::{priority, FifoScheduler, Scheduler, SchedulerStats};

// Threads
pub use thread::{ThreadId, ThreadName, ThreadRef, ThreadState};

// Memory management
pub use mem::{Page, PageAllocator, PagePool};

// Synchronisation
pub use sync::{Lock, Semaphore};

// Errors
pub use errors::{MemoryError, SpawnError};

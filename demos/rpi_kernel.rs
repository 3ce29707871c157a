//! Bare-metal demo kernel for the Raspberry Pi.
//!
//! Boots, turns the boot code into the `main` thread, starts preemption
//! and runs seven tasks that count, divide, compute factorials and take
//! turns on a shared lock. `main` prints a banner ten times and exits.
//!
//! # Building
//!
//! ```bash
//! RUSTFLAGS="-C link-arg=-Tdemos/link.ld" \
//!     cargo build --release --example rpi_kernel --features demo --target aarch64-unknown-none
//! ```
//!
//! # Running
//!
//! ```bash
//! rust-objcopy -O binary target/aarch64-unknown-none/release/examples/rpi_kernel kernel8.img
//! qemu-system-aarch64 -M raspi3b -kernel kernel8.img -serial stdio -display none
//! ```
//!
//! On hardware, copy `kernel8.img` to the SD card boot partition with
//! `arm_64bit=1` in `config.txt`.

#![no_std]
#![no_main]

extern crate alloc;

use rpi_kthreads::arch::aarch64::uptime_us;
use rpi_kthreads::{
    console, priority, DefaultArch, FifoScheduler, InterruptGuard, Kernel, Lock, PagePool,
};

/// Bump allocator over the heap region of the linker script.
///
/// Thread pages are recycled by the page pool, so nothing is ever
/// returned here.
mod allocator {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::null_mut;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use rpi_kthreads::arch::aarch64_boot::{heap_end, heap_start};

    pub struct BumpAllocator {
        /// Next free address, 0 until first use
        next: AtomicUsize,
    }

    unsafe impl GlobalAlloc for BumpAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            loop {
                let observed = self.next.load(Ordering::Relaxed);
                let current = match observed {
                    0 => heap_start(),
                    next => next,
                };
                let aligned = (current + layout.align() - 1) & !(layout.align() - 1);
                let new_next = aligned + layout.size();

                if new_next > heap_end() {
                    return null_mut();
                }

                if self
                    .next
                    .compare_exchange(observed, new_next, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return aligned as *mut u8;
                }
            }
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
    }

    #[global_allocator]
    static ALLOCATOR: BumpAllocator = BumpAllocator {
        next: AtomicUsize::new(0),
    };
}

static KERNEL: Kernel<DefaultArch> = Kernel::new(FifoScheduler::new(), PagePool::new());

static TASK_LOCK: Lock<'static, DefaultArch> = Lock::new(&KERNEL);

const TASKS: [(&str, fn(usize)); 7] = [
    ("Thread 0", counting),
    ("Thread 1", dividing),
    ("Thread 2", locked_random),
    ("Thread 3", timing),
    ("Thread 4", locked_count),
    ("Thread 5", sleeping),
    ("Thread 6", factorials),
];

/// Entered from the boot code with interrupts masked.
#[no_mangle]
pub fn kernel_main() -> ! {
    console::init(log::LevelFilter::Info);

    KERNEL.init();
    log::info!("rpi-kthreads kernel initializing");

    KERNEL.start_preemption();
    log::info!("Finish booting.");

    for (name, task) in TASKS {
        if let Err(e) = KERNEL.create(name, priority::MAX, task, 0) {
            log::error!("cannot start {}: {}", name, e);
        }
    }

    for _ in 0..10 {
        let _irq = InterruptGuard::<DefaultArch>::new();
        log::info!(
            "rpi-kthreads forever: thread {}, priority {}",
            KERNEL.current_name(),
            KERNEL.priority()
        );
    }

    KERNEL.print_stats();
    KERNEL.exit()
}

fn counting(_: usize) {
    for i in 0..50 {
        log::info!("{} {} - Counting {}", KERNEL.current_name(), KERNEL.current_id(), i);
    }
}

fn dividing(_: usize) {
    let (x, y) = (434_343_334i32, 333_443_433i32);
    for _ in 0..3 {
        log::info!("{} - Dividing long numbers {} / {} = {}", KERNEL.current_name(), x, y, x / y);
    }
}

fn locked_random(_: usize) {
    log::info!("Trying to acquire lock: {}", KERNEL.current_name());
    TASK_LOCK.acquire();

    let mut state = uptime_us() | 1;
    for _ in 0..10 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        log::info!("Lock acquired by {} - Random number: {}", KERNEL.current_name(), state as u32);
    }
    TASK_LOCK.release();
}

fn timing(_: usize) {
    for _ in 0..5 {
        log::info!("{} - Uptime {} us", KERNEL.current_name(), uptime_us());
        KERNEL.yield_now();
    }
}

fn locked_count(_: usize) {
    log::info!("Trying to acquire lock: {}", KERNEL.current_name());
    TASK_LOCK.acquire();
    for i in 2..=15 {
        log::info!("Lock acquired by {} - Value {}", KERNEL.current_name(), i);
    }
    TASK_LOCK.release();
}

fn sleeping(_: usize) {
    for _ in 0..20 {
        log::info!("{} - Sleeping 20 ms", KERNEL.current_name());
        let wake = uptime_us() + 20_000;
        while uptime_us() < wake {
            KERNEL.yield_now();
        }
    }
}

fn factorial(n: u64) -> u64 {
    if n <= 1 {
        1
    } else {
        n * factorial(n - 1)
    }
}

fn factorials(_: usize) {
    for i in 2..250u64 {
        let n = i % 20;
        let (a, b) = (factorial(n), factorial(n));
        assert_eq!(a, b);
        log::info!("{} - Factorial({}) = {}", KERNEL.current_name(), n, a);
    }
}

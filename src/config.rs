//! Compile-time kernel configuration.
//!
//! Every tunable of the threading core lives here so boot code, the
//! scheduler and the tests agree on the same numbers.

/// Size of one page. A thread owns exactly one page: TCB at the bottom,
/// stack growing down from the top.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: usize = 12;

/// Timer ticks a thread may run before it is asked to yield.
pub const TIME_SLICE: u32 = 2;

/// Maximum bytes kept from a thread name. Longer names are truncated.
pub const THREAD_NAME_LEN: usize = 20;

/// Marker stored in every live TCB. A mismatch means the page is not a
/// thread or its stack ran into the header.
pub const THREAD_CANARY: u32 = 0xcd6a_bf4b;

/// Period of the preemption timer in microseconds.
pub const TIMER_INTERVAL_US: u32 = 10_000;

/// Dedicated stack the IRQ vector runs the dispatcher on.
pub const IRQ_STACK_SIZE: usize = 4096;

/// Stack the voluntary switch runs its tail on while neither thread's
/// stack is live.
pub const SWITCH_STACK_SIZE: usize = 2048;

/// Name given to the thread that was running at boot.
pub const MAIN_THREAD_NAME: &str = "main";

/// Name given to the idle thread.
pub const IDLE_THREAD_NAME: &str = "idle";

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);
const _: () = assert!(TIME_SLICE > 0);

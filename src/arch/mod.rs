//! Architecture abstraction layer: interrupt control and context switching.
//!
//! Everything the scheduler needs from the CPU goes through [`Arch`]. The
//! kernel never touches registers directly; only the switch leaf and the
//! IRQ vector are architecture code.

mod context;

pub use context::{Context, PSTATE_EL1H_MASKED, PSTATE_IRQ_MASK};

use core::marker::PhantomData;

/// Interrupt mask state of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    /// IRQs masked
    Off,
    /// IRQs delivered
    On,
}

/// Function the voluntary switch runs between saving the outgoing
/// registers and loading the incoming ones.
pub type SwitchTail = extern "C-unwind" fn(usize);

/// First code a new thread executes. Receives `x0..x2` of its initial
/// context.
pub type ThreadEntry = extern "C-unwind" fn(usize, usize, usize) -> !;

/// Receiver of the periodic timer interrupt.
///
/// The IRQ dispatcher calls [`tick`](TickHandler::tick) with the saved
/// frame of the interrupted thread, then, once the handler body is done
/// and only if [`Arch::request_yield_on_return`] was called,
/// [`yield_on_return`](TickHandler::yield_on_return). Whatever context is
/// in the frame afterwards is what the exception return resumes.
pub trait TickHandler: Sync {
    fn tick(&self, frame: &mut Context);
    fn yield_on_return(&self);
}

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations manipulate the interrupt mask and the register file
/// directly. All methods are called on the single CPU the kernel runs on.
pub trait Arch: 'static {
    /// Current interrupt level.
    fn interrupt_level() -> InterruptLevel;

    /// Set the interrupt level and return the previous one.
    fn set_interrupt_level(level: InterruptLevel) -> InterruptLevel;

    /// Unmask IRQs and return the previous level.
    fn enable_interrupts() -> InterruptLevel {
        Self::set_interrupt_level(InterruptLevel::On)
    }

    /// Mask IRQs and return the previous level.
    fn disable_interrupts() -> InterruptLevel {
        Self::set_interrupt_level(InterruptLevel::Off)
    }

    fn interrupts_enabled() -> bool {
        Self::interrupt_level() == InterruptLevel::On
    }

    /// True while the body of an external interrupt handler runs.
    fn in_interrupt() -> bool;

    /// True from IRQ entry until the exception return, including the
    /// yield-on-return phase. While set, the saved frame is the way to
    /// switch threads.
    fn servicing_irq() -> bool;

    /// Ask the IRQ dispatcher to call
    /// [`TickHandler::yield_on_return`] before returning. Only valid
    /// inside an interrupt handler.
    fn request_yield_on_return();

    /// Current stack pointer of the running thread.
    fn stack_pointer() -> usize;

    /// Wait for the next interrupt. Returns after it has been serviced.
    fn wait_for_interrupt();

    /// Route the timer interrupt to `handler` and arm the timer.
    fn install_tick_handler(handler: &'static dyn TickHandler);

    /// Save the running registers into `prev`, run `tail(tail_arg)` off
    /// both thread stacks, then resume `next`.
    ///
    /// Returns when `prev` is resumed.
    ///
    /// # Safety
    ///
    /// - Interrupts must be disabled
    /// - `prev` must be the running thread's context slot
    /// - `next` must hold a context saved by this function, by the IRQ
    ///   vector, or built with [`Context::new_thread`]
    /// - `tail` may free the memory behind `prev` but not behind `next`
    unsafe fn switch_context(
        prev: *mut Context,
        next: *const Context,
        tail: SwitchTail,
        tail_arg: usize,
    );
}

/// Masks interrupts for its lifetime and restores the previous level on
/// drop.
pub struct InterruptGuard<A: Arch> {
    previous: InterruptLevel,
    _arch: PhantomData<fn() -> A>,
}

impl<A: Arch> InterruptGuard<A> {
    pub fn new() -> Self {
        Self {
            previous: A::disable_interrupts(),
            _arch: PhantomData,
        }
    }
}

impl<A: Arch> Default for InterruptGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Drop for InterruptGuard<A> {
    fn drop(&mut self) {
        A::set_interrupt_level(self.previous);
    }
}

// Raspberry Pi - ARM64 bare metal only
#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod aarch64;
#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod aarch64_boot;
#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod aarch64_gic;
#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod aarch64_vectors;
#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub mod uart_pl011;

// Simulated CPU for host testing
#[cfg(any(test, feature = "std-shim"))]
pub mod host;

#[cfg(all(target_arch = "aarch64", not(any(test, feature = "std-shim"))))]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(any(test, feature = "std-shim"))]
pub use host::HostArch as DefaultArch;

// Compile error for unsupported configurations
#[cfg(all(not(target_arch = "aarch64"), not(test), not(feature = "std-shim")))]
compile_error!("This crate targets AArch64 bare metal. Use --target aarch64-unknown-none or enable the std-shim feature for host builds.");

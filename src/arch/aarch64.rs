//! AArch64 (ARM64) architecture implementation.
//!
//! Interrupt masking through DAIF, the voluntary context switch, the
//! generic timer and the state shared with the IRQ vector.

use super::{Arch, Context, InterruptLevel, SwitchTail, TickHandler};
use crate::config::{IRQ_STACK_SIZE, SWITCH_STACK_SIZE, TIMER_INTERVAL_US};
use core::arch::asm;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

/// Set while the body of an IRQ handler runs.
static IN_IRQ: AtomicBool = AtomicBool::new(false);

/// Set from IRQ entry until just before the exception return.
static SERVICING_IRQ: AtomicBool = AtomicBool::new(false);

/// Set by the tick handler when the running thread's slice is over.
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

static TICK_HANDLER: spin::Once<&'static dyn TickHandler> = spin::Once::new();

static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

#[repr(C, align(16))]
pub struct IrqStack {
    data: [u8; IRQ_STACK_SIZE],
}

/// Stack the IRQ vector switches to. The interrupted thread's frame sits
/// at its top.
#[no_mangle]
pub static mut IRQ_STACK: IrqStack = IrqStack {
    data: [0; IRQ_STACK_SIZE],
};

#[repr(C, align(16))]
pub struct SwitchStack {
    data: [u8; SWITCH_STACK_SIZE],
}

/// Stack the switch tail runs on.
#[no_mangle]
pub static mut SWITCH_STACK: SwitchStack = SwitchStack {
    data: [0; SWITCH_STACK_SIZE],
};

pub struct Aarch64Arch;

impl Arch for Aarch64Arch {
    fn interrupt_level() -> InterruptLevel {
        let daif: u64;
        unsafe {
            asm!(
                "mrs {daif}, daif",
                daif = out(reg) daif,
                options(nostack, readonly)
            );
        }
        if daif & super::PSTATE_IRQ_MASK == 0 {
            InterruptLevel::On
        } else {
            InterruptLevel::Off
        }
    }

    fn set_interrupt_level(level: InterruptLevel) -> InterruptLevel {
        let previous = Self::interrupt_level();
        match level {
            InterruptLevel::On => unsafe {
                asm!("msr daifclr, #2", options(nomem, nostack));
            },
            InterruptLevel::Off => unsafe {
                asm!("msr daifset, #2", options(nomem, nostack));
            },
        }
        previous
    }

    fn in_interrupt() -> bool {
        IN_IRQ.load(Ordering::Acquire)
    }

    fn servicing_irq() -> bool {
        SERVICING_IRQ.load(Ordering::Acquire)
    }

    fn request_yield_on_return() {
        assert!(Self::in_interrupt(), "yield-on-return requested outside an interrupt handler");
        YIELD_ON_RETURN.store(true, Ordering::Release);
    }

    fn stack_pointer() -> usize {
        let sp: usize;
        unsafe {
            asm!("mov {sp}, sp", sp = out(reg) sp, options(nomem, nostack));
        }
        sp
    }

    fn wait_for_interrupt() {
        unsafe {
            asm!("wfi", options(nomem, nostack));
        }
    }

    fn install_tick_handler(handler: &'static dyn TickHandler) {
        TICK_HANDLER.call_once(|| handler);
        init_timer();
        if let Err(e) = unsafe { setup_preemption_timer(TIMER_INTERVAL_US) } {
            log::error!("preemption timer not armed: {}", e);
        }
    }

    unsafe fn switch_context(
        prev: *mut Context,
        next: *const Context,
        tail: SwitchTail,
        tail_arg: usize,
    ) {
        // Save everything, FP/NEON included, into prev with the resume
        // point at 1:, run the tail on the switch stack, then
        // exception-return into next. The restore is the same sequence the
        // IRQ vector uses, so next may have been saved by either path.
        unsafe {
            asm!(
                "stp x0, x1, [x0, #0]",
                "stp x2, x3, [x0, #16]",
                "stp x4, x5, [x0, #32]",
                "stp x6, x7, [x0, #48]",
                "stp x8, x9, [x0, #64]",
                "stp x10, x11, [x0, #80]",
                "stp x12, x13, [x0, #96]",
                "stp x14, x15, [x0, #112]",
                "stp x16, x17, [x0, #128]",
                "stp x18, x19, [x0, #144]",
                "stp x20, x21, [x0, #160]",
                "stp x22, x23, [x0, #176]",
                "stp x24, x25, [x0, #192]",
                "stp x26, x27, [x0, #208]",
                "stp x28, x29, [x0, #224]",
                "str x30, [x0, #240]",

                "mov x9, sp",
                "str x9, [x0, #248]",
                "adr x9, 1f",
                "str x9, [x0, #256]",
                // SPSR for EL1h with the current DAIF bits
                "mrs x9, daif",
                "orr x9, x9, #5",
                "str x9, [x0, #264]",
                "stp q0, q1, [x0, #272]",
                "stp q2, q3, [x0, #304]",
                "stp q4, q5, [x0, #336]",
                "stp q6, q7, [x0, #368]",
                "stp q8, q9, [x0, #400]",
                "stp q10, q11, [x0, #432]",
                "stp q12, q13, [x0, #464]",
                "stp q14, q15, [x0, #496]",
                "stp q16, q17, [x0, #528]",
                "stp q18, q19, [x0, #560]",
                "stp q20, q21, [x0, #592]",
                "stp q22, q23, [x0, #624]",
                "stp q24, q25, [x0, #656]",
                "stp q26, q27, [x0, #688]",
                "stp q28, q29, [x0, #720]",
                "stp q30, q31, [x0, #752]",
                "mrs x9, fpcr",
                "str x9, [x0, #784]",
                "mrs x9, fpsr",
                "str x9, [x0, #792]",

                "adrp x9, {switch_stack}",
                "add x9, x9, :lo12:{switch_stack}",
                "add x9, x9, #{switch_stack_size}",
                "mov sp, x9",
                "str x1, [sp, #-16]!",

                "mov x0, x3",
                "blr x2",

                "ldr x29, [sp], #16",
                "ldr x0, [x29, #264]",
                "msr spsr_el1, x0",
                "ldr x0, [x29, #256]",
                "msr elr_el1, x0",
                "ldr x0, [x29, #248]",
                "mov sp, x0",

                "ldr x0, [x29, #784]",
                "msr fpcr, x0",
                "ldr x0, [x29, #792]",
                "msr fpsr, x0",
                "ldp q0, q1, [x29, #272]",
                "ldp q2, q3, [x29, #304]",
                "ldp q4, q5, [x29, #336]",
                "ldp q6, q7, [x29, #368]",
                "ldp q8, q9, [x29, #400]",
                "ldp q10, q11, [x29, #432]",
                "ldp q12, q13, [x29, #464]",
                "ldp q14, q15, [x29, #496]",
                "ldp q16, q17, [x29, #528]",
                "ldp q18, q19, [x29, #560]",
                "ldp q20, q21, [x29, #592]",
                "ldp q22, q23, [x29, #624]",
                "ldp q24, q25, [x29, #656]",
                "ldp q26, q27, [x29, #688]",
                "ldp q28, q29, [x29, #720]",
                "ldp q30, q31, [x29, #752]",

                "ldp x0, x1, [x29, #0]",
                "ldp x2, x3, [x29, #16]",
                "ldp x4, x5, [x29, #32]",
                "ldp x6, x7, [x29, #48]",
                "ldp x8, x9, [x29, #64]",
                "ldp x10, x11, [x29, #80]",
                "ldp x12, x13, [x29, #96]",
                "ldp x14, x15, [x29, #112]",
                "ldp x16, x17, [x29, #128]",
                "ldp x18, x19, [x29, #144]",
                "ldp x20, x21, [x29, #160]",
                "ldp x22, x23, [x29, #176]",
                "ldp x24, x25, [x29, #192]",
                "ldp x26, x27, [x29, #208]",
                "ldr x28, [x29, #224]",
                "ldr x30, [x29, #240]",
                "ldr x29, [x29, #232]",
                "eret",

                "1:",
                switch_stack = sym SWITCH_STACK,
                switch_stack_size = const SWITCH_STACK_SIZE,
                in("x0") prev,
                in("x1") next,
                in("x2") tail,
                in("x3") tail_arg,
                clobber_abi("C"),
            );
        }
    }
}

/// Rust side of the IRQ vector.
///
/// `frame` holds the interrupted thread's registers. Whatever it holds on
/// return is resumed by the vector's exception return.
#[no_mangle]
pub(crate) extern "C" fn irq_dispatch(frame: *mut Context) {
    use super::aarch64_gic::{Gic400, SPURIOUS_IRQ, TIMER_IRQ};

    SERVICING_IRQ.store(true, Ordering::Release);
    IN_IRQ.store(true, Ordering::Release);

    let irq = unsafe { Gic400::acknowledge_interrupt() };
    if irq != SPURIOUS_IRQ {
        if irq == TIMER_IRQ {
            timer_interrupt(frame);
        } else {
            log::warn!("unhandled IRQ {}", irq);
        }
        unsafe { Gic400::end_interrupt(irq) };
    }

    IN_IRQ.store(false, Ordering::Release);

    if YIELD_ON_RETURN.swap(false, Ordering::AcqRel) {
        if let Some(handler) = TICK_HANDLER.get() {
            handler.yield_on_return();
        }
    }

    SERVICING_IRQ.store(false, Ordering::Release);
}

fn timer_interrupt(frame: *mut Context) {
    // Mask the timer output until it is re-armed.
    unsafe {
        asm!(
            "msr cntp_ctl_el0, {val}",
            val = in(reg) 2u64,
            options(nomem, nostack)
        );
    }

    if let Some(handler) = TICK_HANDLER.get() {
        handler.tick(unsafe { &mut *frame });
    }

    let _ = unsafe { setup_preemption_timer(TIMER_INTERVAL_US) };
}

/// Read the generic timer frequency.
pub fn init_timer() {
    let freq: u64;
    unsafe {
        asm!(
            "mrs {freq}, cntfrq_el0",
            freq = out(reg) freq,
            options(nostack, readonly)
        );
    }
    TIMER_FREQ.store(freq, Ordering::Relaxed);
}

/// Arm the EL1 physical timer to fire `interval_us` from now.
///
/// # Safety
///
/// Must be called from privileged mode (EL1). Modifies system timer registers.
pub unsafe fn setup_preemption_timer(interval_us: u32) -> Result<(), &'static str> {
    let freq = TIMER_FREQ.load(Ordering::Relaxed);
    if freq == 0 {
        return Err("Timer frequency not initialized");
    }

    let ticks = (freq * interval_us as u64) / 1_000_000;

    unsafe {
        let current: u64;
        asm!(
            "mrs {current}, cntpct_el0",
            current = out(reg) current,
            options(nostack, readonly)
        );

        asm!(
            "msr cntp_cval_el0, {val}",
            val = in(reg) current + ticks,
            options(nomem, nostack)
        );

        asm!(
            "msr cntp_ctl_el0, {val}",
            val = in(reg) 1u64, // Enable (bit 0) and unmask (bit 1 = 0)
            options(nomem, nostack)
        );
    }

    Ok(())
}

/// Raw counter value of the generic timer.
pub fn timestamp() -> u64 {
    let count: u64;
    unsafe {
        asm!(
            "mrs {count}, cntpct_el0",
            count = out(reg) count,
            options(nostack, readonly)
        );
    }
    count
}

/// Microseconds since the counter started, or 0 before `init_timer`.
pub fn uptime_us() -> u64 {
    match TIMER_FREQ.load(Ordering::Relaxed) {
        0 => 0,
        freq => (timestamp() as u128 * 1_000_000 / freq as u128) as u64,
    }
}

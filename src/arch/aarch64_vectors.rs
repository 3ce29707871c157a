//! AArch64 exception vector table.
//!
//! ARM64 requires a 2048-byte aligned vector table with 16 entries,
//! each 128 bytes apart. Only the EL1h IRQ entry does real work; it saves
//! the interrupted thread as a [`Context`](super::Context) frame at the top
//! of the IRQ stack, runs the dispatcher and returns into whatever context
//! the frame holds afterwards.

use core::arch::{asm, naked_asm};

/// Vector table entry macro - each entry must be exactly 128 bytes.
macro_rules! vector_entry {
    ($handler:ident) => {
        concat!(
            ".align 7\n", // 128-byte alignment
            "b ", stringify!($handler), "\n",
        )
    };
}

/// The exception vector table.
///
/// # Safety
///
/// Never called. Installed at boot via VBAR_EL1.
#[link_section = ".vectors"]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn _vectors() {
    naked_asm!(
        ".align 11", // 2048-byte alignment (2^11)

        // Current EL with SP0 (EL1t)
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),

        // Current EL with SPx (EL1h) - kernel threads run here
        vector_entry!(sync_el1h),
        vector_entry!(irq_el1h),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),

        // Lower EL using AArch64 (no user mode)
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),

        // Lower EL using AArch32 (not supported)
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
        vector_entry!(unexpected_exception),
    );
}

#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn unexpected_exception() {
    naked_asm!(
        "mrs x0, esr_el1",
        "mrs x1, elr_el1",
        "b {fatal}",
        fatal = sym fatal_exception,
    );
}

#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn sync_el1h() {
    // Data/instruction aborts and SVCs are all fatal in the kernel.
    naked_asm!(
        "mrs x0, esr_el1",
        "mrs x1, elr_el1",
        "b {fatal}",
        fatal = sym fatal_exception,
    );
}

extern "C" fn fatal_exception(esr: u64, elr: u64) -> ! {
    panic!(
        "unexpected exception: EC={:#x} ESR={:#x} at {:#x}",
        (esr >> 26) & 0x3F,
        esr,
        elr
    );
}

/// IRQ entry.
///
/// Frame layout matches `Context`:
/// - x[0-30]: offsets 0-240
/// - sp: offset 248
/// - pc (ELR): offset 256
/// - pstate (SPSR): offset 264
/// - q0-q31: offsets 272-768
/// - fpcr, fpsr: offsets 784, 792
#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn irq_el1h() {
    naked_asm!(
        // Park x0-x3 below the thread's SP while we find the frame.
        "sub sp, sp, #32",
        "stp x0, x1, [sp, #0]",
        "stp x2, x3, [sp, #16]",

        // x0 = frame at the top of the IRQ stack
        "adrp x0, {irq_stack}",
        "add x0, x0, :lo12:{irq_stack}",
        "add x0, x0, #{irq_stack_size}",
        "sub x0, x0, #{frame_size}",

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

        "ldp x2, x3, [sp, #0]",
        "stp x2, x3, [x0, #0]",
        "ldp x2, x3, [sp, #16]",
        "stp x2, x3, [x0, #16]",

        // Interrupted SP, ELR, SPSR
        "add x1, sp, #32",
        "str x1, [x0, #248]",
        "mrs x1, elr_el1",
        "str x1, [x0, #256]",
        "mrs x1, spsr_el1",
        "str x1, [x0, #264]",

        // FP/NEON state, before any compiled code can touch it
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
        "mrs x1, fpcr",
        "str x1, [x0, #784]",
        "mrs x1, fpsr",
        "str x1, [x0, #792]",

        // Run the dispatcher below the frame.
        "mov sp, x0",
        "bl {dispatch}",

        // Resume whatever the frame holds now.
        "mov x29, sp",
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
        // x29 last since it is the base pointer
        "ldr x29, [x29, #232]",

        "eret",

        irq_stack = sym super::aarch64::IRQ_STACK,
        irq_stack_size = const crate::config::IRQ_STACK_SIZE,
        frame_size = const super::Context::SIZE,
        dispatch = sym super::aarch64::irq_dispatch,
    );
}

/// Install the exception vector table.
///
/// # Safety
///
/// Must be called once during system initialization with interrupts disabled.
pub unsafe fn install_vector_table() {
    unsafe {
        asm!(
            "adr {tmp}, _vectors",
            "msr vbar_el1, {tmp}",
            "isb",
            tmp = out(reg) _,
            options(nomem, nostack)
        );
    }
}

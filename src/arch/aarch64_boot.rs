//! Boot code for the Raspberry Pi.
//!
//! Parks secondary cores, drops to EL1, clears BSS and enters Rust on the
//! boot page: a page-aligned static whose bottom becomes the TCB of the
//! `main` thread once `Kernel::init` runs.

use crate::config::PAGE_SIZE;
use core::arch::{asm, naked_asm};

// Symbols defined by linker script
extern "C" {
    static __bss_start: u8;
    static __bss_end: u8;
    static __heap_start: u8;
    static __heap_end: u8;
}

#[repr(C, align(4096))]
pub struct BootPage {
    data: [u8; PAGE_SIZE],
}

/// Stack and TCB of the boot thread.
#[no_mangle]
pub static mut BOOT_PAGE: BootPage = BootPage { data: [0; PAGE_SIZE] };

/// Kernel entry point.
///
/// # Safety
///
/// First code in `.text.boot`; never called from Rust.
#[link_section = ".text.boot"]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
            // Park secondary CPUs (only CPU 0 runs the kernel)
            "mrs x0, mpidr_el1",
            "and x0, x0, #0xFF",
            "cbnz x0, .Lpark",

            "mrs x0, CurrentEL",
            "lsr x0, x0, #2",
            "cmp x0, #3",
            "b.eq .Lfrom_el3",
            "cmp x0, #2",
            "b.eq .Lfrom_el2",
            "b .Lat_el1",

        ".Lfrom_el3:",
            "mov x0, #0b1010001001",    // RW | HCE | NS | RES1 bits
            "msr scr_el3, x0",
            "mov x0, #0b00101",         // EL1h
            "orr x0, x0, #(0xF << 6)",  // Mask DAIF
            "msr spsr_el3, x0",
            "adr x0, .Lat_el1",
            "msr elr_el3, x0",
            "eret",

        ".Lfrom_el2:",
            "mov x0, #(1 << 31)",       // HCR_EL2.RW
            "msr hcr_el2, x0",
            "mov x0, #0b00101",         // EL1h
            "orr x0, x0, #(0xF << 6)",  // Mask DAIF
            "msr spsr_el2, x0",
            "adr x0, .Lat_el1",
            "msr elr_el2, x0",
            "eret",

        ".Lat_el1:",
            // Stack at the top of the boot page
            "adrp x0, {boot_page}",
            "add x0, x0, :lo12:{boot_page}",
            "add x0, x0, #{page_size}",
            "mov sp, x0",

            "adrp x0, __bss_start",
            "add x0, x0, :lo12:__bss_start",
            "adrp x1, __bss_end",
            "add x1, x1, :lo12:__bss_end",
        ".Lclear_bss:",
            "cmp x0, x1",
            "b.ge .Lbss_done",
            "str xzr, [x0], #8",
            "b .Lclear_bss",
        ".Lbss_done:",

            // Enable FP/SIMD (don't trap to EL1)
            "mrs x0, cpacr_el1",
            "orr x0, x0, #(3 << 20)",
            "msr cpacr_el1, x0",
            "isb",

            "b {boot_rust}",

        ".Lpark:",
            "wfe",
            "b .Lpark",

            boot_page = sym BOOT_PAGE,
            page_size = const PAGE_SIZE,
            boot_rust = sym boot_rust,
    );
}

/// Install vectors, bring up the GIC and UART, then hand over to
/// `kernel_main` with interrupts still masked.
unsafe fn boot_rust() -> ! {
    unsafe {
        super::aarch64_vectors::install_vector_table();
        super::uart_pl011::init();
        if !super::aarch64_gic::init() {
            crate::pl011_println!("GIC not responding, preemption disabled");
        }

        extern "Rust" {
            fn kernel_main() -> !;
        }

        kernel_main();
    }
}

/// Get the heap start address.
pub fn heap_start() -> usize {
    unsafe { &__heap_start as *const u8 as usize }
}

/// Get the heap end address.
pub fn heap_end() -> usize {
    unsafe { &__heap_end as *const u8 as usize }
}

/// Halt the CPU with interrupts disabled.
#[inline]
pub fn halt() -> ! {
    unsafe {
        asm!("msr daifset, #0xf", options(nomem, nostack));
    }
    loop {
        unsafe {
            asm!("wfe", options(nomem, nostack));
        }
    }
}

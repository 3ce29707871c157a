//! PL011 UART driver (BCM2837, QEMU `-serial stdio`).
//!
//! Output only. Writes spin on the TX FIFO and take no locks, so the
//! panic path can use them with the kernel in any state.

use core::fmt::{self, Write};
use core::ptr::{read_volatile, write_volatile};

const PERIPHERAL_BASE: usize = 0x3F00_0000;

const UART0_BASE: usize = PERIPHERAL_BASE + 0x20_1000;
const UART0_DR: usize = UART0_BASE;
const UART0_FR: usize = UART0_BASE + 0x18;
const UART0_IBRD: usize = UART0_BASE + 0x24;
const UART0_FBRD: usize = UART0_BASE + 0x28;
const UART0_LCRH: usize = UART0_BASE + 0x2C;
const UART0_CR: usize = UART0_BASE + 0x30;
const UART0_ICR: usize = UART0_BASE + 0x44;

const GPIO_BASE: usize = PERIPHERAL_BASE + 0x20_0000;
const GPFSEL1: usize = GPIO_BASE + 0x04;
const GPPUD: usize = GPIO_BASE + 0x94;
const GPPUDCLK0: usize = GPIO_BASE + 0x98;

/// Transmit FIFO full
const FR_TXFF: u32 = 1 << 5;

/// Route GPIO 14/15 to UART0 and enable it at 115200 8N1.
///
/// # Safety
///
/// Must be called once during system initialization.
pub unsafe fn init() {
    unsafe {
        write_volatile(UART0_CR as *mut u32, 0);

        // ALT0 on pins 14 and 15
        let mut gpfsel1 = read_volatile(GPFSEL1 as *const u32);
        gpfsel1 &= !((7 << 12) | (7 << 15));
        gpfsel1 |= (4 << 12) | (4 << 15);
        write_volatile(GPFSEL1 as *mut u32, gpfsel1);

        write_volatile(GPPUD as *mut u32, 0);
        delay_cycles(150);
        write_volatile(GPPUDCLK0 as *mut u32, (1 << 14) | (1 << 15));
        delay_cycles(150);
        write_volatile(GPPUDCLK0 as *mut u32, 0);

        write_volatile(UART0_ICR as *mut u32, 0x7FF);

        // 3 MHz UART clock: 3_000_000 / (16 * 115200) = 1.627
        write_volatile(UART0_IBRD as *mut u32, 1);
        write_volatile(UART0_FBRD as *mut u32, 40);

        // WLEN=8, FEN=1
        write_volatile(UART0_LCRH as *mut u32, (1 << 4) | (1 << 5) | (1 << 6));
        // UARTEN, TXE, RXE
        write_volatile(UART0_CR as *mut u32, (1 << 0) | (1 << 8) | (1 << 9));
    }
}

#[inline]
fn delay_cycles(count: u32) {
    for _ in 0..count {
        core::hint::spin_loop();
    }
}

pub fn send_byte(byte: u8) {
    while unsafe { read_volatile(UART0_FR as *const u32) } & FR_TXFF != 0 {
        core::hint::spin_loop();
    }
    unsafe {
        write_volatile(UART0_DR as *mut u32, byte as u32);
    }
}

pub fn send_str(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            send_byte(b'\r');
        }
        send_byte(byte);
    }
}

/// `fmt::Write` sink over the UART.
pub struct UartWriter;

impl Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        send_str(s);
        Ok(())
    }
}

/// Print a formatted string to PL011 UART.
#[macro_export]
macro_rules! pl011_print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::arch::uart_pl011::UartWriter, $($arg)*);
    }};
}

/// Print a formatted string to PL011 UART with a newline.
#[macro_export]
macro_rules! pl011_println {
    () => {
        $crate::pl011_print!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::pl011_print!($($arg)*);
        $crate::pl011_print!("\n");
    }};
}

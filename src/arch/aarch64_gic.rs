//! GIC-400 (Generic Interrupt Controller v2) driver.
//!
//! Just enough of the controller to route the EL1 physical timer to the
//! boot CPU: distributor and CPU interface setup, acknowledge and EOI.
//!
//! - **Real Pi**: BCM2837 GIC @ `0xFF84_1000`
//! - **QEMU virt machine**: GICv2 @ `0x0800_0000` (feature `qemu-virt`)

use core::ptr::{read_volatile, write_volatile};

#[cfg(feature = "qemu-virt")]
const GICD_BASE: usize = 0x0800_0000;
#[cfg(feature = "qemu-virt")]
const GICC_BASE: usize = 0x0801_0000;

#[cfg(not(feature = "qemu-virt"))]
const GICD_BASE: usize = 0xFF84_1000;
#[cfg(not(feature = "qemu-virt"))]
const GICC_BASE: usize = 0xFF84_2000;

// Distributor registers
const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_ICPENDR: usize = 0x280;
const GICD_IPRIORITYR: usize = 0x400;

// CPU interface registers
const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_BPR: usize = 0x008;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

/// Physical Timer interrupt (EL1 Physical Timer PPI)
pub const TIMER_IRQ: u32 = 30;

/// Spurious interrupt ID
pub const SPURIOUS_IRQ: u32 = 1023;

pub struct Gic400;

impl Gic400 {
    /// Initialize distributor and CPU interface for CPU 0.
    ///
    /// Returns false if the controller does not respond.
    ///
    /// # Safety
    ///
    /// Must be called once during system initialization with interrupts
    /// disabled.
    pub unsafe fn init() -> bool {
        let typer = unsafe { read_volatile((GICD_BASE + GICD_TYPER) as *const u32) };
        if typer == 0xFFFF_FFFF || typer == 0 {
            return false;
        }
        let num_irqs = ((typer & 0x1F) + 1) * 32;

        unsafe {
            write_volatile((GICD_BASE + GICD_CTLR) as *mut u32, 0);

            for i in (0..num_irqs).step_by(32) {
                let offset = (i / 32) as usize * 4;
                write_volatile((GICD_BASE + GICD_ICENABLER + offset) as *mut u32, 0xFFFF_FFFF);
                write_volatile((GICD_BASE + GICD_ICPENDR + offset) as *mut u32, 0xFFFF_FFFF);
            }

            // Lowest priority everywhere
            for i in (0..num_irqs).step_by(4) {
                write_volatile((GICD_BASE + GICD_IPRIORITYR + i as usize) as *mut u32, 0xFFFF_FFFF);
            }

            write_volatile((GICD_BASE + GICD_CTLR) as *mut u32, 1);

            write_volatile((GICC_BASE + GICC_PMR) as *mut u32, 0xFF);
            write_volatile((GICC_BASE + GICC_BPR) as *mut u32, 0);
            write_volatile((GICC_BASE + GICC_CTLR) as *mut u32, 1);
        }

        true
    }

    /// # Safety
    ///
    /// Must be called after GIC initialization. IRQ number must be valid.
    pub unsafe fn enable_irq(irq: u32) {
        let reg_offset = (irq / 32) as usize * 4;
        let bit = 1u32 << (irq % 32);
        unsafe {
            write_volatile((GICD_BASE + GICD_ISENABLER + reg_offset) as *mut u32, bit);
        }
    }

    /// # Safety
    ///
    /// Must be called after GIC initialization. IRQ number must be valid.
    pub unsafe fn set_priority(irq: u32, priority: u8) {
        let byte_offset = irq as usize & 3;
        let reg_addr = GICD_BASE + GICD_IPRIORITYR + (irq as usize & !3);

        unsafe {
            let mut val = read_volatile(reg_addr as *const u32);
            val &= !(0xFF << (byte_offset * 8));
            val |= (priority as u32) << (byte_offset * 8);
            write_volatile(reg_addr as *mut u32, val);
        }
    }

    /// # Safety
    ///
    /// Must be called from interrupt context after GIC initialization.
    #[inline]
    pub unsafe fn acknowledge_interrupt() -> u32 {
        unsafe { read_volatile((GICC_BASE + GICC_IAR) as *const u32) & 0x3FF }
    }

    /// # Safety
    ///
    /// `irq` must be the value returned by the matching acknowledge.
    #[inline]
    pub unsafe fn end_interrupt(irq: u32) {
        unsafe {
            write_volatile((GICC_BASE + GICC_EOIR) as *mut u32, irq);
        }
    }
}

/// Initialize the GIC and enable the timer interrupt.
///
/// # Safety
///
/// Must be called once during system initialization.
pub unsafe fn init() -> bool {
    unsafe {
        if !Gic400::init() {
            return false;
        }
        Gic400::set_priority(TIMER_IRQ, 0x80);
        Gic400::enable_irq(TIMER_IRQ);
    }
    true
}

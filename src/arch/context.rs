//! Saved register state of a thread that is not running.

/// SPSR value for EL1h with D, A, I and F masked.
pub const PSTATE_EL1H_MASKED: u64 = 0x3c5;

/// PSTATE.I, the IRQ mask bit. Same position in DAIF and SPSR.
pub const PSTATE_IRQ_MASK: u64 = 1 << 7;

/// Register file of a suspended thread.
///
/// The same layout is used for the frame the IRQ vector saves, so moving a
/// thread in or out of an interrupt is a plain copy. The FP/NEON registers
/// are part of every context: the compiler uses them for ordinary copies
/// and formatting, not only for floating point.
///
/// Layout (byte offsets used by the assembly):
/// - `x[0..31]`: 0..248 (`x[30]` is the link register)
/// - `sp`: 248
/// - `pc`: 256 (ELR on exception return)
/// - `pstate`: 264 (SPSR on exception return)
/// - `neon[0..32]`: 272..784 (q0-q31)
/// - `fpcr`: 784
/// - `fpsr`: 792
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub neon: [u128; 32],
    pub fpcr: u64,
    pub fpsr: u64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: PSTATE_EL1H_MASKED,
            neon: [0; 32],
            fpcr: 0,
            fpsr: 0,
        }
    }
}

impl Context {
    /// Size of a saved context in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Context of a thread that has never run.
    ///
    /// It starts at `pc` on the stack ending at `sp` with IRQs masked and
    /// the first three arguments in `x0..x2`.
    pub fn new_thread(pc: usize, sp: usize, args: [usize; 3]) -> Self {
        let mut ctx = Self::default();
        ctx.x[0] = args[0] as u64;
        ctx.x[1] = args[1] as u64;
        ctx.x[2] = args[2] as u64;
        ctx.sp = (sp & !0xF) as u64;
        ctx.pc = pc as u64;
        ctx
    }

    /// Copy of an interrupt frame.
    #[inline]
    pub fn capture(frame: &Context) -> Context {
        *frame
    }

    /// Write this context into an interrupt frame so the exception
    /// return resumes it.
    #[inline]
    pub fn restore(&self, frame: &mut Context) {
        *frame = *self;
    }

    /// Whether IRQs are unmasked in this context.
    pub fn irqs_enabled(&self) -> bool {
        self.pstate & PSTATE_IRQ_MASK == 0
    }

    pub fn set_irqs_enabled(&mut self, enabled: bool) {
        if enabled {
            self.pstate &= !PSTATE_IRQ_MASK;
        } else {
            self.pstate |= PSTATE_IRQ_MASK;
        }
    }
}

const _: () = assert!(Context::SIZE == 800);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        assert_eq!(core::mem::offset_of!(Context, sp), 248);
        assert_eq!(core::mem::offset_of!(Context, pc), 256);
        assert_eq!(core::mem::offset_of!(Context, pstate), 264);
        assert_eq!(core::mem::offset_of!(Context, neon), 272);
        assert_eq!(core::mem::offset_of!(Context, fpcr), 784);
        assert_eq!(core::mem::offset_of!(Context, fpsr), 792);
        assert_eq!(Context::SIZE % 16, 0);
    }

    #[test]
    fn test_new_thread_context() {
        let ctx = Context::new_thread(0x8_0000, 0x1_0008, [1, 2, 3]);
        assert_eq!(&ctx.x[..3], &[1, 2, 3]);
        assert_eq!(ctx.sp, 0x1_0000);
        assert_eq!(ctx.pc, 0x8_0000);
        assert!(!ctx.irqs_enabled());
    }

    #[test]
    fn test_capture_restore_is_bit_exact() {
        let mut frame = Context::default();
        for (i, reg) in frame.x.iter_mut().enumerate() {
            *reg = 0x0101_0101_0101_0101u64.wrapping_mul(i as u64 + 1);
        }
        frame.sp = 0xdead_bee0;
        frame.pc = 0x0040_1234;
        frame.pstate = 0x6000_0345;
        for (i, q) in frame.neon.iter_mut().enumerate() {
            *q = u128::MAX / (i as u128 + 3);
        }
        frame.fpcr = 0x0300_0000;
        frame.fpsr = 0x1f;

        let saved = Context::capture(&frame);
        let mut other = Context::default();
        saved.restore(&mut other);
        assert_eq!(other, frame);
    }

    #[test]
    fn test_irq_mask_bit() {
        let mut ctx = Context::default();
        assert!(!ctx.irqs_enabled());
        ctx.set_irqs_enabled(true);
        assert!(ctx.irqs_enabled());
        assert_eq!(ctx.pstate, PSTATE_EL1H_MASKED & !PSTATE_IRQ_MASK);
    }
}

//! Simulated single-core CPU for running the kernel on a host OS.
//!
//! Every kernel thread is backed by an OS thread, but only the one holding
//! the CPU runs; the others wait on a condition variable. A context saved
//! by the simulator names the OS thread it belongs to, so resuming it hands
//! the CPU over instead of loading registers. A context built with
//! [`Context::new_thread`] starts a fresh OS thread at its entry point.
//!
//! Timer interrupts are raised explicitly with [`timer_interrupt`] or
//! [`raise_irq`], or by [`Arch::wait_for_interrupt`] when a tick handler is
//! installed. An interrupt raised while IRQs are masked is dropped.

extern crate std;

use super::{Arch, Context, InterruptLevel, SwitchTail, ThreadEntry, TickHandler};
use crate::config::PAGE_SIZE;
use alloc::string::{String, ToString};
use core::cell::RefCell;
use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Program counter of a context whose thread is parked in the simulator.
const PARKED_PC: u64 = 0xdead_0000_0000_0001;

/// Register holding the OS-thread slot of a parked context (the platform
/// register, never touched by kernel code).
const SLOT_REG: usize = 18;

/// Back-to-back idle waits with no thread switch before the simulator
/// gives up.
const STALL_LIMIT: u32 = 100_000;

struct CpuState {
    level: InterruptLevel,
    in_interrupt: bool,
    servicing: bool,
    yield_requested: bool,
    /// Slot allowed to run
    running: usize,
    next_slot: usize,
    failure: Option<String>,
    timer: Option<&'static dyn TickHandler>,
    idle_waits: u32,
}

struct HostCpu {
    state: Mutex<CpuState>,
    wake: Condvar,
}

#[derive(Clone)]
struct Slot {
    cpu: Arc<HostCpu>,
    id: usize,
    sp: usize,
}

std::thread_local! {
    static SLOT: RefCell<Option<Slot>> = const { RefCell::new(None) };
}

fn current_slot() -> Slot {
    match SLOT.with(|slot| slot.borrow().clone()) {
        Some(slot) => slot,
        None => panic!("no simulated CPU on this thread; call host::boot() first"),
    }
}

fn with_cpu<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
    let slot = current_slot();
    let mut state = slot.cpu.lock();
    f(&mut state)
}

fn parked_context(slot: usize, sp: usize, level: InterruptLevel) -> Context {
    let mut ctx = Context::default();
    ctx.pc = PARKED_PC;
    ctx.x[SLOT_REG] = slot as u64;
    ctx.sp = sp as u64;
    ctx.set_irqs_enabled(level == InterruptLevel::On);
    ctx
}

fn level_of(ctx: &Context) -> InterruptLevel {
    if ctx.irqs_enabled() {
        InterruptLevel::On
    } else {
        InterruptLevel::Off
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl HostCpu {
    fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the CPU to the thread described by `ctx`.
    fn resume(self: &Arc<Self>, ctx: &Context) {
        let mut state = self.lock();
        state.level = level_of(ctx);
        state.idle_waits = 0;

        if ctx.pc == PARKED_PC {
            state.running = ctx.x[SLOT_REG] as usize;
            self.wake.notify_all();
        } else {
            let id = state.next_slot;
            state.next_slot += 1;
            state.running = id;
            drop(state);
            self.start(id, *ctx);
        }
    }

    fn start(self: &Arc<Self>, id: usize, ctx: Context) {
        let cpu = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(std::format!("kthread-{}", id))
            .spawn(move || {
                SLOT.with(|slot| {
                    *slot.borrow_mut() = Some(Slot {
                        cpu: Arc::clone(&cpu),
                        id,
                        sp: ctx.sp as usize,
                    })
                });

                let entry = unsafe { core::mem::transmute::<usize, ThreadEntry>(ctx.pc as usize) };
                let (a, b, c) = (ctx.x[0] as usize, ctx.x[1] as usize, ctx.x[2] as usize);
                let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| {
                    entry(a, b, c);
                }));
                if let Err(payload) = result {
                    cpu.fail(panic_message(&*payload));
                }
            });

        if let Err(e) = spawned {
            panic!("cannot start simulated thread: {}", e);
        }
    }

    /// Wait until slot `me` holds the CPU.
    fn park(&self, me: usize) {
        let mut state = self.lock();
        while state.running != me && state.failure.is_none() {
            state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(failure) = state.failure.clone() {
            drop(state);
            panic!("simulated CPU halted: {}", failure);
        }
    }

    fn fail(&self, message: String) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(message);
        }
        self.wake.notify_all();
    }
}

/// Put the calling OS thread on a fresh simulated CPU as its boot thread.
///
/// Returns the base of the boot page; the stack pointer reported by
/// [`HostArch`] lies inside it, so the kernel's `init` writes the main TCB
/// there. Interrupts start masked.
pub fn boot() -> usize {
    let layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(e) => panic!("bad boot page layout: {}", e),
    };
    let page = unsafe { alloc_zeroed(layout) };
    if page.is_null() {
        handle_alloc_error(layout);
    }

    let cpu = Arc::new(HostCpu {
        state: Mutex::new(CpuState {
            level: InterruptLevel::Off,
            in_interrupt: false,
            servicing: false,
            yield_requested: false,
            running: 0,
            next_slot: 1,
            failure: None,
            timer: None,
            idle_waits: 0,
        }),
        wake: Condvar::new(),
    });

    SLOT.with(|slot| {
        *slot.borrow_mut() = Some(Slot {
            cpu,
            id: 0,
            sp: page as usize + PAGE_SIZE - 64,
        })
    });
    page as usize
}

/// Deliver one interrupt to `handler` on the calling thread.
///
/// Mirrors the IRQ vector: the handler body sees the interrupted thread's
/// frame, may ask for a yield on return, and whatever context is left in
/// the frame is resumed. Returns `false` without doing anything if IRQs
/// are masked or an interrupt is already being handled.
pub fn raise_irq(handler: &dyn TickHandler) -> bool {
    let slot = current_slot();
    let interrupted = {
        let mut state = slot.cpu.lock();
        if state.level == InterruptLevel::Off || state.in_interrupt {
            return false;
        }
        let interrupted = state.level;
        state.level = InterruptLevel::Off;
        state.in_interrupt = true;
        state.servicing = true;
        interrupted
    };

    let mut frame = parked_context(slot.id, slot.sp, interrupted);
    handler.tick(&mut frame);

    let yield_requested = {
        let mut state = slot.cpu.lock();
        state.in_interrupt = false;
        core::mem::take(&mut state.yield_requested)
    };
    if yield_requested {
        handler.yield_on_return();
    }
    slot.cpu.lock().servicing = false;

    if frame.pc == PARKED_PC && frame.x[SLOT_REG] as usize == slot.id {
        slot.cpu.lock().level = level_of(&frame);
    } else {
        slot.cpu.resume(&frame);
        slot.cpu.park(slot.id);
    }
    true
}

/// Deliver a timer interrupt to the installed tick handler.
///
/// Returns `false` if no handler is installed or the interrupt was dropped.
pub fn timer_interrupt() -> bool {
    match with_cpu(|state| state.timer) {
        Some(handler) => raise_irq(handler),
        None => false,
    }
}

/// [`Arch`] implementation on the simulated CPU.
pub struct HostArch;

impl Arch for HostArch {
    fn interrupt_level() -> InterruptLevel {
        with_cpu(|state| state.level)
    }

    fn set_interrupt_level(level: InterruptLevel) -> InterruptLevel {
        with_cpu(|state| core::mem::replace(&mut state.level, level))
    }

    fn in_interrupt() -> bool {
        with_cpu(|state| state.in_interrupt)
    }

    fn servicing_irq() -> bool {
        with_cpu(|state| state.servicing)
    }

    fn request_yield_on_return() {
        with_cpu(|state| {
            assert!(state.in_interrupt, "yield-on-return requested outside an interrupt");
            state.yield_requested = true;
        })
    }

    fn stack_pointer() -> usize {
        current_slot().sp
    }

    fn wait_for_interrupt() {
        let timer = with_cpu(|state| {
            state.idle_waits += 1;
            (state.idle_waits <= STALL_LIMIT).then_some(state.timer)
        });
        match timer {
            Some(Some(handler)) => {
                raise_irq(handler);
            }
            Some(None) => std::thread::yield_now(),
            None => panic!("simulated CPU stalled: no thread became ready"),
        }
    }

    fn install_tick_handler(handler: &'static dyn TickHandler) {
        with_cpu(|state| state.timer = Some(handler));
    }

    unsafe fn switch_context(
        prev: *mut Context,
        next: *const Context,
        tail: SwitchTail,
        tail_arg: usize,
    ) {
        let slot = current_slot();
        let level = slot.cpu.lock().level;

        let next = unsafe { *next };
        unsafe { prev.write(parked_context(slot.id, slot.sp, level)) };

        tail(tail_arg);

        slot.cpu.resume(&next);
        slot.cpu.park(slot.id);
    }
}

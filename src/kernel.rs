//! Thread lifecycle and the context-switch protocol.
//!
//! All scheduler state lives in one [`Kernel`] value behind a spin lock
//! that is only ever taken with interrupts disabled. A switch happens in
//! one of two ways:
//!
//! - **interrupt path**: while the IRQ dispatcher is servicing the timer,
//!   the outgoing thread's registers are already in the saved frame. The
//!   frame is copied into the outgoing TCB and the incoming context is
//!   copied over the frame, so the exception return resumes it.
//! - **voluntary path**: `block`, `yield_now` and `exit` from thread code
//!   call [`Arch::switch_context`], which saves the live registers and
//!   runs [`finish_switch`](Kernel) on the switch stack before loading
//!   the incoming thread.
//!
//! Both paths end in the same state: the quantum counter reset, the
//! incoming thread Running, and an exited outgoing thread's page freed.

use crate::arch::{Arch, Context, InterruptGuard, InterruptLevel, ThreadEntry, TickHandler};
use crate::config::{IDLE_THREAD_NAME, MAIN_THREAD_NAME, TIME_SLICE};
use crate::errors::SpawnError;
use crate::mem::{Page, PageAllocator, PagePool};
use crate::sched::{priority, FifoScheduler, Scheduler, SchedulerStats};
use crate::sync::Semaphore;
use crate::thread::{AllLink, Tcb, ThreadId, ThreadList, ThreadName, ThreadRef, ThreadState};
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr::NonNull;
use spin::Mutex;

/// Tick and switch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Timer ticks taken while the idle thread was running
    pub idle_ticks: u64,
    /// Timer ticks taken while any other thread was running
    pub kernel_ticks: u64,
    /// Switches where the incoming thread differed from the outgoing one
    pub context_switches: u64,
    pub threads_created: u64,
    /// Exited threads whose page has been returned
    pub threads_reaped: u64,
}

struct KernelState<S> {
    scheduler: S,
    /// Every live thread
    all: ThreadList<AllLink>,
    running: Option<ThreadRef>,
    idle: Option<ThreadRef>,
    /// Thread that was running at boot; its page is not ours to free
    initial: Option<ThreadRef>,
    /// Ticks the running thread has used of its quantum
    slice_ticks: u32,
    stats: KernelStats,
    /// Frame of the interrupt being serviced
    irq_frame: Option<NonNull<Context>>,
    /// Voluntary switch waiting for its tail
    pending_switch: Option<(ThreadRef, ThreadRef)>,
}

// SAFETY: the frame pointer and TCB handles are only used on the one CPU
// with interrupts disabled.
unsafe impl<S: Send> Send for KernelState<S> {}

impl<S: Scheduler> KernelState<S> {
    /// Head of the ready queue, or the idle thread when it is empty.
    fn pick_next(&mut self) -> ThreadRef {
        match self.scheduler.pick_next().or(self.idle) {
            Some(next) => next,
            None => panic!("no thread ready to run and no idle thread"),
        }
    }
}

/// The threading core of the kernel.
///
/// # Type Parameters
///
/// * `A` - Architecture implementation
/// * `S` - Ready-queue policy
/// * `P` - Source of thread pages
pub struct Kernel<A: Arch, S: Scheduler = FifoScheduler, P: PageAllocator = PagePool> {
    state: Mutex<KernelState<S>>,
    /// Next thread id; separate from `state` so ids can be taken without it
    tid_lock: Mutex<u32>,
    pages: P,
    _arch: PhantomData<fn() -> A>,
}

impl<A: Arch, S: Scheduler, P: PageAllocator> Kernel<A, S, P> {
    pub const fn new(scheduler: S, pages: P) -> Self {
        Self {
            state: Mutex::new(KernelState {
                scheduler,
                all: ThreadList::new(),
                running: None,
                idle: None,
                initial: None,
                slice_ticks: 0,
                stats: KernelStats {
                    idle_ticks: 0,
                    kernel_ticks: 0,
                    context_switches: 0,
                    threads_created: 0,
                    threads_reaped: 0,
                },
                irq_frame: None,
                pending_switch: None,
            }),
            tid_lock: Mutex::new(1),
            pages,
            _arch: PhantomData,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut KernelState<S>) -> R) -> R {
        let _irq = InterruptGuard::<A>::new();
        let mut state = self.state.lock();
        f(&mut state)
    }

    fn allocate_tid(&self) -> ThreadId {
        let _irq = InterruptGuard::<A>::new();
        let mut next = self.tid_lock.lock();
        let id = *next;
        *next += 1;
        match ThreadId::new(id) {
            Some(id) => id,
            None => panic!("thread id space exhausted"),
        }
    }

    /// Turn the code running at boot into the `main` thread.
    ///
    /// Must be called once, with interrupts disabled, before any other
    /// operation. The TCB is written at the bottom of the page holding the
    /// current stack; the stack itself is left intact.
    #[doc(alias = "thread_system_init")]
    pub fn init(&self) {
        assert_eq!(
            A::interrupt_level(),
            InterruptLevel::Off,
            "thread system initialised with interrupts enabled"
        );

        let tcb = Tcb::containing(A::stack_pointer());
        let id = self.allocate_tid();

        let mut state = self.state.lock();
        assert!(state.running.is_none(), "thread system initialised twice");

        let main = unsafe {
            Tcb::write(tcb, id, MAIN_THREAD_NAME, priority::DEFAULT, ThreadState::Running)
        };
        state.all.push_back(main);
        state.running = Some(main);
        state.initial = Some(main);

        log::info!("thread system up: {} thread {} at {:#x}", MAIN_THREAD_NAME, id, main.page_base());
    }

    /// Create the idle thread, route the timer to this kernel and enable
    /// interrupts. Returns once the idle thread has run.
    pub fn start_preemption(&'static self) {
        let started: Semaphore<'static, A, S, P> = Semaphore::new(self, 0);
        let arg = &started as *const Semaphore<'static, A, S, P> as usize;

        let idle = match self.create_thread(IDLE_THREAD_NAME, priority::MIN, idle_main::<A, S, P>, arg) {
            Ok(idle) => idle,
            Err(e) => panic!("cannot create the idle thread: {}", e),
        };
        self.with_state(|state| state.idle = Some(idle));

        A::install_tick_handler(self);
        A::enable_interrupts();
        started.down();

        log::info!("preemption started, idle thread {}", idle.id());
    }

    /// Create a thread running `entry(arg)` and make it ready.
    ///
    /// The new thread may run before this returns. Returns
    /// [`SpawnError::OutOfMemory`] if no page is available; nothing is
    /// changed in that case.
    ///
    /// # Panics
    ///
    /// If `priority` is outside `priority::MIN..=priority::MAX`.
    pub fn create(
        &'static self,
        name: &str,
        priority: u8,
        entry: fn(usize),
        arg: usize,
    ) -> Result<ThreadId, SpawnError> {
        self.create_thread(name, priority, entry, arg).map(ThreadRef::id)
    }

    /// Create a thread running a closure.
    pub fn spawn<F>(&'static self, name: &str, priority: u8, f: F) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        fn closure_trampoline<F: FnOnce()>(arg: usize) {
            let f = unsafe { Box::from_raw(arg as *mut F) };
            f();
        }

        let arg = Box::into_raw(Box::new(f)) as usize;
        match self.create(name, priority, closure_trampoline::<F>, arg) {
            Ok(id) => Ok(id),
            Err(e) => {
                drop(unsafe { Box::from_raw(arg as *mut F) });
                Err(e)
            }
        }
    }

    fn create_thread(
        &'static self,
        name: &str,
        priority: u8,
        entry: fn(usize),
        arg: usize,
    ) -> Result<ThreadRef, SpawnError> {
        assert!(
            priority::is_valid(priority),
            "priority {} outside {}..={}",
            priority,
            priority::MIN,
            priority::MAX
        );

        let irq = InterruptGuard::<A>::new();

        let page = self.pages.alloc_page().map_err(|e| {
            log::warn!("cannot create thread {:?}: {}", name, e);
            SpawnError::from(e)
        })?;
        let id = self.allocate_tid();
        let stack_top = page.top();

        let thread = unsafe {
            Tcb::write(page.into_raw() as *mut Tcb, id, name, priority, ThreadState::Blocked)
        };
        let ctx = Context::new_thread(
            thread_entry::<A, S, P> as ThreadEntry as usize,
            stack_top,
            [self as *const Self as usize, entry as usize, arg],
        );
        unsafe { thread.context_ptr().write(ctx) };

        {
            let mut state = self.state.lock();
            state.all.push_back(thread);
            state.stats.threads_created += 1;
        }
        drop(irq);

        log::debug!("created thread {} {:?} priority {}", id, thread.name(), priority);
        self.unblock(thread);
        Ok(thread)
    }

    /// Put the running thread to sleep until [`unblock`](Self::unblock).
    ///
    /// # Panics
    ///
    /// If called from an interrupt handler or with interrupts enabled.
    pub fn block(&self) {
        assert!(!A::in_interrupt(), "block called from an interrupt handler");
        assert_eq!(
            A::interrupt_level(),
            InterruptLevel::Off,
            "block called with interrupts enabled"
        );

        let current = self.current();
        current.set_state(ThreadState::Blocked);
        self.schedule();
    }

    /// Make a blocked thread ready. Never preempts the caller; usable from
    /// interrupt handlers.
    pub fn unblock(&self, thread: ThreadRef) {
        assert!(thread.is_valid(), "unblock of a non-thread at {:#x}", thread.page_base());

        let _irq = InterruptGuard::<A>::new();
        assert_eq!(
            thread.state(),
            ThreadState::Blocked,
            "unblock of thread {} that is not blocked",
            thread.id()
        );

        let mut state = self.state.lock();
        debug_assert!(!state.scheduler.contains(thread), "blocked thread {} is queued", thread.id());
        state.scheduler.enqueue(thread);
        thread.set_state(ThreadState::Ready);
    }

    /// Give up the CPU. The caller stays runnable and goes to the back of
    /// the ready queue (the idle thread is never queued).
    pub fn yield_now(&self) {
        assert!(!A::in_interrupt(), "yield called from an interrupt handler");

        let _irq = InterruptGuard::<A>::new();
        let current = self.current();
        assert_eq!(
            current.state(),
            ThreadState::Running,
            "yield from thread {} that is not running",
            current.id()
        );

        {
            let mut state = self.state.lock();
            if state.idle != Some(current) {
                debug_assert!(!state.scheduler.contains(current), "running thread {} is queued", current.id());
                state.scheduler.enqueue(current);
            }
            current.set_state(ThreadState::Ready);
        }
        self.schedule();
    }

    /// Terminate the running thread. Its page is freed by the switch that
    /// follows.
    pub fn exit(&self) -> ! {
        assert!(!A::in_interrupt(), "exit called from an interrupt handler");

        A::disable_interrupts();
        let current = self.current();
        assert_eq!(
            current.state(),
            ThreadState::Running,
            "exit from thread {} that is not running",
            current.id()
        );

        {
            let mut state = self.state.lock();
            state.all.remove(current);
            current.set_state(ThreadState::Dying);
        }
        log::debug!("thread {} {:?} exiting", current.id(), current.name());

        self.schedule();
        panic!("exited thread {} was resumed", current.id());
    }

    /// Timer interrupt bookkeeping.
    ///
    /// Records `frame` for an interrupt-path switch, charges the tick to
    /// the idle or kernel counter, and asks for a yield on return once the
    /// running thread has used its quantum.
    pub fn tick(&self, frame: &mut Context) {
        assert!(A::in_interrupt(), "tick outside an interrupt handler");

        let mut state = self.state.lock();
        state.irq_frame = Some(NonNull::from(frame));

        if state.running.is_some() && state.running == state.idle {
            state.stats.idle_ticks += 1;
        } else {
            state.stats.kernel_ticks += 1;
        }

        state.slice_ticks += 1;
        if state.slice_ticks >= TIME_SLICE {
            A::request_yield_on_return();
        }
    }

    /// Switch from the running thread, which has already left the Running
    /// state, to the next one.
    fn schedule(&self) {
        assert_eq!(
            A::interrupt_level(),
            InterruptLevel::Off,
            "schedule with interrupts enabled"
        );

        let mut state = self.state.lock();
        let Some(current) = state.running else {
            panic!("schedule without a running thread");
        };
        assert_ne!(
            current.state(),
            ThreadState::Running,
            "schedule while thread {} is still running",
            current.id()
        );
        let next = state.pick_next();
        assert!(next.is_valid(), "next thread at {:#x} is not a thread", next.page_base());
        if current != next {
            check_saved_stack(next);
        }

        log::trace!("schedule {} -> {}", current.id(), next.id());

        if A::servicing_irq() {
            let Some(frame) = state.irq_frame else {
                panic!("interrupt-path switch without a saved frame");
            };
            // SAFETY: the frame lives on the IRQ stack until the exception
            // return, which is after this call.
            let frame = unsafe { &mut *frame.as_ptr() };
            unsafe { current.context_ptr().write(Context::capture(frame)) };
            check_saved_stack(current);
            if current != next {
                next.context().restore(frame);
            }
            self.finish_switch(&mut state, current, next);
        } else if current == next {
            self.finish_switch(&mut state, current, next);
        } else {
            state.pending_switch = Some((current, next));
            drop(state);
            unsafe {
                A::switch_context(
                    current.context_ptr(),
                    next.context_ptr(),
                    switch_tail::<A, S, P>,
                    self as *const Self as usize,
                );
            }
        }
    }

    /// Common end of both switch paths.
    fn finish_switch(&self, state: &mut KernelState<S>, prev: ThreadRef, next: ThreadRef) {
        state.slice_ticks = 0;
        next.set_state(ThreadState::Running);
        state.running = Some(next);

        if prev != next {
            state.stats.context_switches += 1;
        }

        if prev.state() == ThreadState::Dying && state.initial != Some(prev) {
            assert_ne!(prev, next, "dying thread {} scheduled itself", prev.id());
            self.reap(state, prev);
        }
    }

    fn complete_switch(&self) {
        let mut state = self.state.lock();
        let Some((prev, next)) = state.pending_switch.take() else {
            panic!("switch tail ran without a pending switch");
        };
        check_saved_stack(prev);
        self.finish_switch(&mut state, prev, next);
    }

    fn reap(&self, state: &mut KernelState<S>, thread: ThreadRef) {
        let id = thread.id();
        thread.invalidate();
        match unsafe { Page::from_raw(thread.page_base()) } {
            Ok(page) => self.pages.free_page(page),
            Err(e) => panic!("thread {} has no page of its own: {}", id, e),
        }
        state.stats.threads_reaped += 1;
        log::debug!("reaped thread {}", id);
    }

    /// Handle of the running thread.
    ///
    /// # Panics
    ///
    /// If the kernel is not initialised or the thread's canary is gone.
    pub fn current(&self) -> ThreadRef {
        let Some(current) = self.with_state(|state| state.running) else {
            panic!("no current thread: thread system not initialised");
        };
        assert!(
            current.is_valid(),
            "thread at {:#x} has a clobbered canary (stack overflow?)",
            current.page_base()
        );
        current
    }

    pub fn current_id(&self) -> ThreadId {
        self.current().id()
    }

    pub fn current_name(&self) -> ThreadName {
        self.current().name()
    }

    /// Priority of the running thread.
    pub fn priority(&self) -> u8 {
        self.current().priority()
    }

    /// Set the running thread's priority. Stored only; scheduling order
    /// does not change.
    pub fn set_priority(&self, new_priority: u8) {
        assert!(
            priority::is_valid(new_priority),
            "priority {} outside {}..={}",
            new_priority,
            priority::MIN,
            priority::MAX
        );
        self.current().set_priority(new_priority);
    }

    /// Run `action` on every live thread.
    ///
    /// `action` runs under the kernel lock and must not call back into the
    /// kernel.
    ///
    /// # Panics
    ///
    /// If interrupts are enabled.
    pub fn for_each(&self, mut action: impl FnMut(ThreadRef)) {
        assert_eq!(
            A::interrupt_level(),
            InterruptLevel::Off,
            "for_each with interrupts enabled"
        );
        let state = self.state.lock();
        for thread in state.all.iter() {
            action(thread);
        }
    }

    /// Number of live threads (created and not yet exited).
    pub fn thread_count(&self) -> usize {
        self.with_state(|state| state.all.len())
    }

    /// Number of threads in the ready queue.
    pub fn ready_count(&self) -> usize {
        self.with_state(|state| state.scheduler.len())
    }

    pub fn idle_thread(&self) -> Option<ThreadRef> {
        self.with_state(|state| state.idle)
    }

    pub fn stats(&self) -> KernelStats {
        self.with_state(|state| state.stats)
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.with_state(|state| state.scheduler.stats())
    }

    /// Log the tick counters.
    pub fn print_stats(&self) {
        let stats = self.stats();
        log::info!(
            "Thread: {} idle ticks, {} kernel ticks, {} switches",
            stats.idle_ticks,
            stats.kernel_ticks,
            stats.context_switches
        );
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }
}

impl<A: Arch, S: Scheduler, P: PageAllocator> TickHandler for Kernel<A, S, P> {
    fn tick(&self, frame: &mut Context) {
        Kernel::tick(self, frame);
    }

    fn yield_on_return(&self) {
        self.yield_now();
    }
}

/// Runs on the switch stack after the outgoing registers are saved.
/// Panics unless the saved stack pointer of `thread` lies in its own page.
fn check_saved_stack(thread: ThreadRef) {
    let sp = thread.context().sp as usize;
    assert!(
        thread.owns_address(sp),
        "thread {} saved stack pointer {:#x} outside its page at {:#x}",
        thread.id(),
        sp,
        thread.page_base()
    );
}

extern "C-unwind" fn switch_tail<A: Arch, S: Scheduler, P: PageAllocator>(kernel: usize) {
    let kernel = unsafe { &*(kernel as *const Kernel<A, S, P>) };
    kernel.complete_switch();
}

/// First code of every created thread.
extern "C-unwind" fn thread_entry<A: Arch, S: Scheduler, P: PageAllocator>(
    kernel: usize,
    entry: usize,
    arg: usize,
) -> ! {
    let kernel = unsafe { &*(kernel as *const Kernel<A, S, P>) };
    let entry = unsafe { core::mem::transmute::<usize, fn(usize)>(entry) };

    // The scheduler hands over with interrupts masked.
    A::enable_interrupts();
    entry(arg);
    kernel.exit()
}

fn idle_main<A: Arch, S: Scheduler, P: PageAllocator>(started: usize) {
    let started = unsafe { &*(started as *const Semaphore<'static, A, S, P>) };
    let kernel = started.kernel();
    started.up();

    loop {
        let old = A::disable_interrupts();
        kernel.block();
        A::set_interrupt_level(old);
        A::wait_for_interrupt();
    }
}

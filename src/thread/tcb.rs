//! Thread control block.
//!
//! Every thread lives in one page: the TCB at offset 0 and the stack
//! growing down from the top of the page toward it. The canary is the last
//! field, so a stack that overruns the page is caught the next time the
//! thread is looked up.

use super::list::Link;
use super::{ThreadId, ThreadName, ThreadState};
use crate::arch::Context;
use crate::config::{PAGE_SIZE, THREAD_CANARY};
use crate::mem::page_round_down;
use core::fmt;
use core::ptr::{addr_of, addr_of_mut, NonNull};

#[repr(C)]
pub struct Tcb {
    id: ThreadId,
    state: ThreadState,
    priority: u8,
    name: ThreadName,
    /// Valid only while the thread is not running
    context: Context,
    pub(super) all_link: Link,
    pub(super) ready_link: Link,
    canary: u32,
}

const _: () = assert!(core::mem::size_of::<Tcb>() <= PAGE_SIZE / 4);

impl Tcb {
    /// Initialise a TCB at `at`. Only the header is written; the rest of
    /// the page (possibly a live stack) is left alone.
    ///
    /// # Safety
    ///
    /// `at` must be the base of a page the caller owns.
    pub unsafe fn write(
        at: *mut Tcb,
        id: ThreadId,
        name: &str,
        priority: u8,
        state: ThreadState,
    ) -> ThreadRef {
        debug_assert_eq!(at as usize % PAGE_SIZE, 0);
        unsafe {
            at.write(Tcb {
                id,
                state,
                priority,
                name: ThreadName::new(name),
                context: Context::default(),
                all_link: Link::new(),
                ready_link: Link::new(),
                canary: THREAD_CANARY,
            });
            ThreadRef(NonNull::new_unchecked(at))
        }
    }

    /// TCB address of the page containing `sp`.
    pub fn containing(sp: usize) -> *mut Tcb {
        page_round_down(sp) as *mut Tcb
    }
}

/// Non-owning handle to a TCB.
///
/// Handles are what the ready queue, wait queues and the registry hold.
/// A handle stays usable until the kernel frees the page after the thread
/// has exited; [`is_valid`](Self::is_valid) detects stale or corrupted
/// ones through the canary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(NonNull<Tcb>);

// SAFETY: TCBs are only touched with interrupts disabled on the one CPU.
unsafe impl Send for ThreadRef {}
unsafe impl Sync for ThreadRef {}

impl ThreadRef {
    /// # Safety
    ///
    /// `tcb` must point at a TCB written by [`Tcb::write`] whose page is
    /// still allocated.
    pub unsafe fn from_raw(tcb: *mut Tcb) -> Option<Self> {
        NonNull::new(tcb).map(Self)
    }

    pub fn as_ptr(self) -> *mut Tcb {
        self.0.as_ptr()
    }

    /// Base of the page holding this thread.
    pub fn page_base(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// True if the canary is intact.
    pub fn is_valid(self) -> bool {
        unsafe { addr_of!((*self.as_ptr()).canary).read_volatile() == THREAD_CANARY }
    }

    /// Clear the canary so stale handles fail [`is_valid`](Self::is_valid).
    pub(crate) fn invalidate(self) {
        unsafe { addr_of_mut!((*self.as_ptr()).canary).write_volatile(0) };
    }

    pub fn id(self) -> ThreadId {
        unsafe { (*self.as_ptr()).id }
    }

    pub fn state(self) -> ThreadState {
        unsafe { (*self.as_ptr()).state }
    }

    pub(crate) fn set_state(self, state: ThreadState) {
        unsafe { (*self.as_ptr()).state = state };
    }

    pub fn name(self) -> ThreadName {
        unsafe { (*self.as_ptr()).name }
    }

    pub fn priority(self) -> u8 {
        unsafe { (*self.as_ptr()).priority }
    }

    pub(crate) fn set_priority(self, priority: u8) {
        unsafe { (*self.as_ptr()).priority = priority };
    }

    /// Slot the thread's registers are saved to while it is off the CPU.
    pub fn context_ptr(self) -> *mut Context {
        unsafe { addr_of_mut!((*self.as_ptr()).context) }
    }

    /// Copy of the saved registers.
    pub fn context(self) -> Context {
        unsafe { self.context_ptr().read() }
    }

    /// True if `addr` lies inside this thread's page.
    pub fn owns_address(self, addr: usize) -> bool {
        page_round_down(addr) == self.page_base() || addr == self.page_base() + PAGE_SIZE
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Thread({} {:?} {})", self.id(), self.name(), self.state())
        } else {
            write!(f, "Thread(<invalid> @ {:#x})", self.page_base())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{PageAllocator, PagePool};

    fn tcb_in(pool: &PagePool) -> ThreadRef {
        let page = pool.alloc_page().unwrap();
        let id = ThreadId::new(5).unwrap();
        unsafe { Tcb::write(page.into_raw() as *mut Tcb, id, "worker", 31, ThreadState::Blocked) }
    }

    #[test]
    fn test_tcb_fields() {
        let pool = PagePool::new();
        let t = tcb_in(&pool);

        assert!(t.is_valid());
        assert_eq!(t.id().get(), 5);
        assert_eq!(t.name().as_str(), "worker");
        assert_eq!(t.priority(), 31);
        assert_eq!(t.state(), ThreadState::Blocked);

        t.set_state(ThreadState::Ready);
        t.set_priority(40);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.priority(), 40);
    }

    #[test]
    fn test_containing_finds_page_base() {
        let pool = PagePool::new();
        let t = tcb_in(&pool);
        let sp = t.page_base() + PAGE_SIZE - 64;

        assert_eq!(Tcb::containing(sp), t.as_ptr());
        assert!(t.owns_address(sp));
        assert!(t.owns_address(t.page_base() + PAGE_SIZE));
        assert!(!t.owns_address(t.page_base() + 2 * PAGE_SIZE));
    }

    #[test]
    fn test_canary_detects_overrun() {
        let pool = PagePool::new();
        let t = tcb_in(&pool);

        // A stack that grows into the header hits the canary first.
        let canary = unsafe { addr_of_mut!((*t.as_ptr()).canary) };
        unsafe { canary.write(0x4141_4141) };
        assert!(!t.is_valid());
    }

    #[test]
    fn test_invalidate() {
        let pool = PagePool::new();
        let t = tcb_in(&pool);
        t.invalidate();
        assert!(!t.is_valid());
    }
}

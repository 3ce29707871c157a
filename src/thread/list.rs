//! Intrusive doubly-linked lists of threads.
//!
//! A TCB carries two independent links: `all_link` for the registry of
//! live threads and `ready_link`, used by whichever single queue the thread
//! is waiting in (the ready queue or one semaphore's waiters). Lists never
//! allocate; they only rewire links inside TCBs.

use super::tcb::{Tcb, ThreadRef};
use core::marker::PhantomData;
use core::ptr::addr_of_mut;

/// Link field embedded in a TCB.
#[derive(Debug, Default)]
pub struct Link {
    prev: Option<ThreadRef>,
    next: Option<ThreadRef>,
    linked: bool,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
        }
    }
}

/// Picks which link of a TCB a list uses.
pub trait LinkSelector {
    fn link(tcb: *mut Tcb) -> *mut Link;
}

/// Selects `all_link`.
pub struct AllLink;

/// Selects `ready_link`.
pub struct ReadyLink;

impl LinkSelector for AllLink {
    fn link(tcb: *mut Tcb) -> *mut Link {
        unsafe { addr_of_mut!((*tcb).all_link) }
    }
}

impl LinkSelector for ReadyLink {
    fn link(tcb: *mut Tcb) -> *mut Link {
        unsafe { addr_of_mut!((*tcb).ready_link) }
    }
}

/// FIFO list of threads threaded through link `L`.
pub struct ThreadList<L: LinkSelector> {
    head: Option<ThreadRef>,
    tail: Option<ThreadRef>,
    len: usize,
    _link: PhantomData<L>,
}

// SAFETY: only manipulated with interrupts disabled on the one CPU.
unsafe impl<L: LinkSelector> Send for ThreadList<L> {}

impl<L: LinkSelector> Default for ThreadList<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LinkSelector> ThreadList<L> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _link: PhantomData,
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn link_of(thread: ThreadRef) -> &'static mut Link {
        unsafe { &mut *L::link(thread.as_ptr()) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `thread`. Panics if it is already on a list using `L`.
    pub fn push_back(&mut self, thread: ThreadRef) {
        let link = Self::link_of(thread);
        assert!(!link.linked, "thread {} is already queued", thread.id());

        link.prev = self.tail;
        link.next = None;
        link.linked = true;

        match self.tail {
            Some(tail) => Self::link_of(tail).next = Some(thread),
            None => self.head = Some(thread),
        }
        self.tail = Some(thread);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<ThreadRef> {
        let head = self.head?;
        self.unlink(head);
        Some(head)
    }

    /// Remove `thread` from anywhere in the list. Panics if it is not
    /// linked.
    pub fn remove(&mut self, thread: ThreadRef) {
        assert!(Self::link_of(thread).linked, "thread {} is not queued", thread.id());
        debug_assert!(self.contains(thread));
        self.unlink(thread);
    }

    fn unlink(&mut self, thread: ThreadRef) {
        let link = Self::link_of(thread);
        let (prev, next) = (link.prev.take(), link.next.take());
        link.linked = false;

        match prev {
            Some(prev) => Self::link_of(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => Self::link_of(next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub fn contains(&self, thread: ThreadRef) -> bool {
        self.iter().any(|t| t == thread)
    }

    pub fn iter(&self) -> Iter<'_, L> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

pub struct Iter<'a, L: LinkSelector> {
    next: Option<ThreadRef>,
    _list: PhantomData<&'a ThreadList<L>>,
}

impl<L: LinkSelector> Iterator for Iter<'_, L> {
    type Item = ThreadRef;

    fn next(&mut self) -> Option<ThreadRef> {
        let current = self.next?;
        self.next = unsafe { (*L::link(current.as_ptr())).next };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{PageAllocator, PagePool};
    use crate::thread::{ThreadId, ThreadState};
    use alloc::vec::Vec;

    fn threads(pool: &PagePool, n: u32) -> Vec<ThreadRef> {
        (1..=n)
            .map(|id| {
                let page = pool.alloc_page().unwrap();
                unsafe {
                    Tcb::write(
                        page.into_raw() as *mut Tcb,
                        ThreadId::new(id).unwrap(),
                        "t",
                        31,
                        ThreadState::Ready,
                    )
                }
            })
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let pool = PagePool::new();
        let t = threads(&pool, 3);
        let mut list: ThreadList<ReadyLink> = ThreadList::new();

        for &thread in &t {
            list.push_back(thread);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(), Some(t[0]));
        assert_eq!(list.pop_front(), Some(t[1]));
        assert_eq!(list.pop_front(), Some(t[2]));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let pool = PagePool::new();
        let t = threads(&pool, 4);
        let mut list: ThreadList<AllLink> = ThreadList::new();
        for &thread in &t {
            list.push_back(thread);
        }

        list.remove(t[1]);
        list.remove(t[3]);
        assert_eq!(list.iter().collect::<Vec<_>>(), [t[0], t[2]]);

        list.remove(t[0]);
        assert_eq!(list.iter().collect::<Vec<_>>(), [t[2]]);
        list.push_back(t[1]);
        assert_eq!(list.iter().collect::<Vec<_>>(), [t[2], t[1]]);
    }

    #[test]
    fn test_links_are_independent() {
        let pool = PagePool::new();
        let t = threads(&pool, 2);
        let mut all: ThreadList<AllLink> = ThreadList::new();
        let mut ready: ThreadList<ReadyLink> = ThreadList::new();

        all.push_back(t[0]);
        all.push_back(t[1]);
        ready.push_back(t[1]);

        assert_eq!(ready.pop_front(), Some(t[1]));
        assert_eq!(all.len(), 2);
        assert!(all.contains(t[1]));
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn test_double_push_panics() {
        let pool = PagePool::new();
        let t = threads(&pool, 1);
        let mut a: ThreadList<ReadyLink> = ThreadList::new();
        let mut b: ThreadList<ReadyLink> = ThreadList::new();
        a.push_back(t[0]);
        b.push_back(t[0]);
    }
}

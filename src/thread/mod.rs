//! Thread identity, state and the per-page thread control block.

pub mod list;
pub mod tcb;

pub use list::{AllLink, Link, LinkSelector, ReadyLink, ThreadList};
pub use tcb::{Tcb, ThreadRef};

use crate::config::THREAD_NAME_LEN;
use core::fmt;
use core::num::NonZeroU32;

/// Unique, never reused thread identifier. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// `None` for 0.
    pub const fn new(id: u32) -> Option<Self> {
        match NonZeroU32::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Get the raw ID value.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// Lifecycle state of a thread.
///
/// ```text
/// create ─► Blocked ─unblock─► Ready ─dispatch─► Running
///              ▲                  ▲                 │
///              └──── block ───────┼──── yield ──────┤
///                                                    └─ exit ─► Dying ─► (page freed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Dying = 3,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadState::Running => "running",
            ThreadState::Ready => "ready",
            ThreadState::Blocked => "blocked",
            ThreadState::Dying => "dying",
        };
        f.write_str(s)
    }
}

/// Fixed-capacity thread name stored inline in the TCB.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadName {
    bytes: [u8; THREAD_NAME_LEN],
    len: u8,
}

impl ThreadName {
    /// Copy `name`, truncated to `THREAD_NAME_LEN` bytes on a char
    /// boundary.
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(THREAD_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0; THREAD_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { bytes, len: len as u8 }
    }

    pub fn as_str(&self) -> &str {
        // Built from a &str cut on a char boundary.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ThreadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

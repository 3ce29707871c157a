//! Error types for the threading core.
//!
//! Only resource exhaustion is recoverable. Everything else the kernel
//! can detect (wrong thread state, clobbered canary, lock misuse, calls
//! from the wrong context) is a broken invariant and panics.

#![allow(clippy::uninlined_format_args)]

use core::fmt;

/// Errors that can occur while creating a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// No page was available for the thread's TCB and stack
    OutOfMemory,
}

/// Errors reported by the page allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The pool reached its page limit or the backing allocator failed
    OutOfMemory,
    /// An address handed back to the pool is not page aligned
    Misaligned(usize),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "no free page for the thread control block"),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "page pool exhausted"),
            MemoryError::Misaligned(addr) => write!(f, "address {:#x} is not page aligned", addr),
        }
    }
}

impl From<MemoryError> for SpawnError {
    fn from(error: MemoryError) -> Self {
        match error {
            MemoryError::OutOfMemory | MemoryError::Misaligned(_) => SpawnError::OutOfMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_display() {
        let err = SpawnError::OutOfMemory;
        assert_eq!(err.to_string(), "no free page for the thread control block");
        assert_eq!(MemoryError::OutOfMemory.to_string(), "page pool exhausted");

        let err = MemoryError::Misaligned(0x1234);
        assert_eq!(err.to_string(), "address 0x1234 is not page aligned");
    }

    #[test]
    fn test_error_conversion() {
        let err: SpawnError = MemoryError::OutOfMemory.into();
        assert_eq!(err, SpawnError::OutOfMemory);

        let err: SpawnError = MemoryError::Misaligned(0x10).into();
        assert_eq!(err, SpawnError::OutOfMemory);
    }
}

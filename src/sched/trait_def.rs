//! Scheduler trait definition.

use crate::thread::ThreadRef;

/// Ready-queue policy.
///
/// The kernel owns the scheduler behind its state lock and only calls it
/// with interrupts disabled, so implementations need no internal locking.
pub trait Scheduler: Send + 'static {
    /// Add a thread that just became ready.
    ///
    /// # Arguments
    ///
    /// * `thread` - Thread in state Ready, not on any ready-link list
    fn enqueue(&mut self, thread: ThreadRef);

    /// Remove and return the thread to run next, or `None` if nothing is
    /// ready. The kernel falls back to the idle thread on `None`.
    fn pick_next(&mut self) -> Option<ThreadRef>;

    /// Whether `thread` is currently queued.
    fn contains(&self, thread: ThreadRef) -> bool;

    /// Number of queued threads.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get scheduler statistics.
    fn stats(&self) -> SchedulerStats;
}

/// Counters kept by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total `enqueue` calls
    pub enqueued: u64,
    /// Total threads handed out by `pick_next`
    pub dequeued: u64,
    /// Threads queued right now
    pub queued: usize,
}

/// Priority range of kernel threads.
///
/// Priorities are validated and stored but the FIFO policy does not
/// consult them.
pub mod priority {
    /// Lowest priority
    pub const MIN: u8 = 0;

    /// Priority of the boot thread and the usual default
    pub const DEFAULT: u8 = 31;

    /// Highest priority
    pub const MAX: u8 = 63;

    /// True if `priority` is within `MIN..=MAX`.
    pub const fn is_valid(priority: u8) -> bool {
        matches!(priority, MIN..=MAX)
    }
}

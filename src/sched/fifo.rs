//! First-in first-out ready queue.

use super::trait_def::{Scheduler, SchedulerStats};
use crate::thread::{ReadyLink, ThreadList, ThreadRef, ThreadState};

/// Round-robin by arrival order: a yielding thread goes to the back, the
/// front runs next.
pub struct FifoScheduler {
    queue: ThreadList<ReadyLink>,
    enqueued: u64,
    dequeued: u64,
}

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoScheduler {
    pub const fn new() -> Self {
        Self {
            queue: ThreadList::new(),
            enqueued: 0,
            dequeued: 0,
        }
    }
}

impl Scheduler for FifoScheduler {
    fn enqueue(&mut self, thread: ThreadRef) {
        debug_assert_ne!(thread.state(), ThreadState::Dying);
        self.queue.push_back(thread);
        self.enqueued += 1;
    }

    fn pick_next(&mut self) -> Option<ThreadRef> {
        let next = self.queue.pop_front()?;
        self.dequeued += 1;
        Some(next)
    }

    fn contains(&self, thread: ThreadRef) -> bool {
        self.queue.contains(thread)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            queued: self.queue.len(),
        }
    }
}

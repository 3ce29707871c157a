//! Scheduling policy.

pub mod fifo;
pub mod trait_def;

pub use fifo::FifoScheduler;
pub use trait_def::{priority, Scheduler, SchedulerStats};

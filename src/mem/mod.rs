//! Memory management for thread pages.

pub mod page;

pub use page::{page_round_down, Page, PageAllocator, PagePool, PagePoolStats};

//! Scenario tests running the kernel on the simulated CPU.

mod helpers;
mod integration;

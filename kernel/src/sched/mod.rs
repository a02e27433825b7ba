//! Scheduling
//!
//! Per-CPU ready queues plus the dispatch loop and the sleep/wakeup
//! protocol built on top of them.

pub mod queue;
mod scheduler;

pub use queue::ReadyQueues;

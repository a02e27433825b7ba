//! Process management
//!
//! Descriptors, the pool that owns them, pid lookup and the fork/exit/wait
//! lifecycle.

mod lifecycle;
mod manager;
pub mod pid_index;
pub mod pool;
pub mod proc;

pub use lifecycle::{CopyDst, CopySrc};
pub use manager::{ProcInfo, ProcTable};
pub use proc::{Proc, ProcName, ProcState, Slot, WaitChannel};

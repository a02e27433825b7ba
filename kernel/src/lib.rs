//! NOS Process Core
//!
//! This crate is the process-management core of the NOS kernel. It owns the
//! process descriptors and everything that decides which of them runs where.
//!
//! # Architecture
//!
//! - **Collections** (`collections`): byte-oriented growable array backing the slot table
//! - **Sync** (`sync`): interrupt-aware spinlocks
//! - **CPU** (`cpu`): per-CPU state and interrupt nesting
//! - **Process** (`process`): descriptor pool, pid index, fork/exit/wait lifecycle
//! - **Scheduler** (`sched`): per-CPU ready queues, dispatch loop, sleep/wakeup
//!
//! Everything below the process core (page allocator, page tables, files,
//! trap return, register-level switching) is reached through the
//! `nos_api::Platform` trait, so the same code runs on hardware and in the
//! hosted simulation used by the integration tests.
//!
//! # Usage
//!
//! ```ignore
//! let table: &'static ProcTable<Board> = Box::leak(Box::new(ProcTable::new(board, ProcConfig::default())?));
//! table.create_first_process(INITCODE)?;
//! // on every hart:
//! table.scheduler();
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collections;
pub mod config;
pub mod cpu;
pub mod process;
pub mod sched;
pub mod sync;

// Re-export key types for external use
pub use crate::config::{Placement, ProcConfig, NCPU, NOFILE, NPROC, PID_BUCKETS, PROC_NAME_LEN};
pub use crate::cpu::Machine;
pub use crate::process::{CopyDst, CopySrc, Proc, ProcInfo, ProcState, ProcTable, Slot, WaitChannel};
pub use crate::sync::{IrqMutex, SpinLock};

pub use nos_api::{Error, Pid, Result};

//! NOS API - Core interfaces and types for the NOS operating system
//!
//! This crate provides the types and abstractions shared between the process
//! core (`nos-proc`) and the collaborators it calls into: the physical page
//! allocator, address-space management, the file layer and the
//! architecture-specific trap/switch primitives.
//!
//! # Architecture
//!
//! - **Error**: Common error type and result alias
//! - **Memory**: Page constants, PTE flags, page/heap allocators, address spaces
//! - **Process**: Register images (`TrapFrame`, `Context`) and process ids
//! - **Arch**: CPU identity, interrupt control and context switching
//! - **Fs**: File and working-directory handles
//! - **Platform**: The umbrella trait the process core is generic over
//!
//! # Design Principles
//!
//! - **Dependency Inversion**: The process core depends on these traits only
//! - **Interface Segregation**: Small, focused interfaces per collaborator

#![no_std]
#![allow(dead_code)]

#[cfg(feature = "std")]
extern crate std;

pub mod arch;
pub mod error;
pub mod fs;
pub mod memory;
pub mod platform;
pub mod process;

// Re-export commonly used types
pub use crate::arch::Arch;
pub use crate::error::{Error, Result};
pub use crate::fs::FileOps;
pub use crate::memory::{AddressSpaceOps, HeapAllocator, KernelMemory, PhysAddr, PteFlags, PAGE_SIZE};
pub use crate::platform::Platform;
pub use crate::process::{Context, ContextEntry, Pid, TrapFrame};

//! Memory management module

pub mod interface;
pub mod types;

// Re-export commonly used items
pub use interface::{AddressSpaceOps, HeapAllocator, KernelMemory};
pub use types::*;

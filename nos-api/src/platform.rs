//! Platform umbrella trait

use crate::arch::Arch;
use crate::fs::FileOps;
use crate::memory::{AddressSpaceOps, KernelMemory};

/// Everything the process core needs from the machine and the rest of the
/// kernel
pub trait Platform: Arch + KernelMemory + AddressSpaceOps + FileOps + Send + Sync + 'static {}

impl<T> Platform for T where T: Arch + KernelMemory + AddressSpaceOps + FileOps + Send + Sync + 'static {}

//! Process core configuration
//!
//! Compile-time limits plus the runtime `ProcConfig` handed to
//! `ProcTable::new`.

use nos_api::{Error, Result};
use static_assertions::const_assert;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of live processes
pub const NPROC: usize = 64;

/// Maximum number of CPUs supported
pub const NCPU: usize = 8;

/// Buckets in the pid index
pub const PID_BUCKETS: usize = 64;

/// Open files per process
pub const NOFILE: usize = 16;

/// Bytes in a process name
pub const PROC_NAME_LEN: usize = 16;

const_assert!(NPROC > 0);
const_assert!(NCPU > 0);
const_assert!(PROC_NAME_LEN >= "initcode".len());

// ============================================================================
// Types
// ============================================================================

/// Which ready queue a process that becomes runnable is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// The queue of the CPU executing the enqueue
    LocalCpu,
    /// The shortest queue, ties going to the executing CPU
    #[default]
    LeastLoaded,
}

/// Runtime configuration of the process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcConfig {
    /// Cap on descriptors that are not `Unused`
    pub max_procs: usize,
    /// Number of CPUs running the scheduler loop
    pub ncpu: usize,
    /// Buckets in the pid index
    pub pid_buckets: usize,
    /// Ready-queue placement policy
    pub placement: Placement,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            max_procs: NPROC,
            ncpu: NCPU,
            pid_buckets: PID_BUCKETS,
            placement: Placement::default(),
        }
    }
}

impl ProcConfig {
    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub fn with_pid_buckets(mut self, pid_buckets: usize) -> Self {
        self.pid_buckets = pid_buckets;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Reject configurations the table cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_procs == 0 {
            return Err(Error::InvalidArgument("max_procs must be non-zero"));
        }
        if self.ncpu == 0 {
            return Err(Error::InvalidArgument("ncpu must be non-zero"));
        }
        if self.pid_buckets == 0 {
            return Err(Error::InvalidArgument("pid_buckets must be non-zero"));
        }
        Ok(())
    }
}

//! Error handling module for NOS operating system

use core::fmt;

/// Common error type used by the process core and its collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out of memory (page allocator or kernel heap exhausted)
    OutOfMemory,
    /// A capacity computation overflowed
    CapacityOverflow,
    /// The live-process limit has been reached
    ProcessTableFull,
    /// The caller has no children to wait for, or was killed while waiting
    NoChildren,
    /// There is no current process on this CPU
    NoProcess,
    /// No process with the requested pid exists
    NotFound,
    /// A user address was outside the process image
    BadAddress,
    /// Invalid argument
    InvalidArgument(&'static str),
}

impl Error {
    /// Value handed back across the syscall boundary.
    ///
    /// The kernel ABI reports every failure as `-1`.
    pub const fn errno(&self) -> isize {
        -1
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::CapacityOverflow => write!(f, "Capacity overflow"),
            Error::ProcessTableFull => write!(f, "Process table full"),
            Error::NoChildren => write!(f, "No child processes"),
            Error::NoProcess => write!(f, "No current process"),
            Error::NotFound => write!(f, "No such process"),
            Error::BadAddress => write!(f, "Bad address"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

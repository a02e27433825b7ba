//! Memory management types

use bitflags::bitflags;

/// Bytes per page
pub const PAGE_SIZE: usize = 4096;

/// One beyond the highest user-visible virtual address.
///
/// Sv39 allows 39 bits; one bit less is used so that addresses never
/// need sign extension.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Trampoline page, mapped at the top of every address space
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

/// Per-process trap frame page, just below the trampoline
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// Round a byte count up to a whole number of pages
#[inline]
pub const fn page_round_up(sz: usize) -> usize {
    (sz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Physical address of a kernel page (the kernel is identity mapped)
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw address value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Page-table entry permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: usize {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// Accessible from user mode
        const U = 1 << 4;
    }
}

//! Memory management interfaces
//!
//! The process core never manipulates page tables or the physical free list
//! itself. It asks for whole pages, for small heap blocks, and for address
//! space operations through the traits below.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::Result;
use super::types::{PhysAddr, PteFlags};

/// Byte-granular kernel heap
pub trait HeapAllocator {
    /// Allocate a block for `layout`, or `None` when the heap is exhausted
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block to the heap
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this heap with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Physical page allocator plus a handle to the kernel heap
pub trait KernelMemory {
    /// Heap handle type
    type Heap: HeapAllocator + Clone + Send + Sync;

    /// Allocate one zero-filled or junk-filled page of `PAGE_SIZE` bytes
    fn alloc_page(&self) -> Option<NonNull<u8>>;

    /// Free a page obtained from `alloc_page`
    ///
    /// # Safety
    ///
    /// The page must not be referenced after this call.
    unsafe fn free_page(&self, page: NonNull<u8>);

    /// Handle to the kernel heap
    fn heap(&self) -> Self::Heap;
}

/// User address-space management
pub trait AddressSpaceOps {
    /// Opaque per-process address space (a root page table on hardware)
    type AddressSpace: Send;

    /// Create an empty address space
    fn create_address_space(&self) -> Option<Self::AddressSpace>;

    /// Map `[va, va + size)` to physical memory starting at `pa`
    fn map_pages(
        &self,
        space: &mut Self::AddressSpace,
        va: usize,
        size: usize,
        pa: PhysAddr,
        flags: PteFlags,
    ) -> Result<()>;

    /// Remove `npages` mappings starting at `va`, freeing the backing pages
    /// when `free` is set
    fn unmap_pages(&self, space: &mut Self::AddressSpace, va: usize, npages: usize, free: bool);

    /// Free user memory `[0, size)` and then the address space itself
    fn destroy_address_space(&self, space: Self::AddressSpace, size: usize);

    /// Physical page holding the trap entry/return code
    fn trampoline(&self) -> PhysAddr;

    /// Load the first user image at virtual address 0.
    /// The image must fit in one page.
    fn map_first_segment(&self, space: &mut Self::AddressSpace, image: &[u8]) -> Result<()>;

    /// Grow user memory from `old` to `new` bytes, returning the new size
    fn grow(&self, space: &mut Self::AddressSpace, old: usize, new: usize, flags: PteFlags)
        -> Result<usize>;

    /// Shrink user memory from `old` to `new` bytes, returning the new size
    fn shrink(&self, space: &mut Self::AddressSpace, old: usize, new: usize) -> usize;

    /// Copy both page tables and memory contents of `[0, size)`.
    /// On failure `dst` holds no user mappings.
    fn copy_address_space(
        &self,
        src: &Self::AddressSpace,
        dst: &mut Self::AddressSpace,
        size: usize,
    ) -> Result<()>;

    /// Copy kernel bytes to user virtual address `va`
    fn copy_out(&self, space: &mut Self::AddressSpace, va: usize, src: &[u8]) -> Result<()>;

    /// Copy user bytes at virtual address `va` into `dst`
    fn copy_in(&self, space: &Self::AddressSpace, dst: &mut [u8], va: usize) -> Result<()>;
}

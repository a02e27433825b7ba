//! Growable byte array
//!
//! A contiguous buffer of fixed-size elements drawn from the kernel heap.
//! Capacity and length are counted in elements. Every byte-size product is
//! checked, and every reallocation either fully succeeds or leaves the array
//! exactly as it was.
//!
//! Growth doubles (starting at [`MIN_CAPACITY`]); `pop` releases the buffer
//! once empty and halves the capacity when utilization falls to a quarter,
//! so memory waste stays within a factor of four of the live contents.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};

use nos_api::{Error, HeapAllocator, Result};

/// Capacity of the first buffer and the floor for doubling
pub const MIN_CAPACITY: usize = 8;

/// Alignment of every backing buffer
const BUF_ALIGN: usize = 16;

/// Growable array of `elem_size`-byte elements
pub struct DynamicArray<H: HeapAllocator> {
    data: Option<NonNull<u8>>,
    capacity: usize,
    size: usize,
    elem_size: usize,
    heap: H,
}

// The buffer is uniquely owned.
unsafe impl<H: HeapAllocator + Send> Send for DynamicArray<H> {}

impl<H: HeapAllocator> DynamicArray<H> {
    /// Empty array; no buffer is allocated until the first push
    pub fn new(elem_size: usize, heap: H) -> Result<Self> {
        Self::with_capacity(0, elem_size, heap)
    }

    /// Array with room for `capacity` elements
    pub fn with_capacity(capacity: usize, elem_size: usize, heap: H) -> Result<Self> {
        if elem_size == 0 {
            return Err(Error::InvalidArgument("element size must be non-zero"));
        }
        let mut arr = Self {
            data: None,
            capacity: 0,
            size: 0,
            elem_size,
            heap,
        };
        if capacity > 0 {
            arr.data = Some(arr.alloc_buf(capacity)?);
            arr.capacity = capacity;
        }
        Ok(arr)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Bytes of element `idx`
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        if idx >= self.size {
            return None;
        }
        // idx < size <= capacity, so the element lies inside the buffer.
        Some(unsafe { core::slice::from_raw_parts(self.slot_ptr(idx), self.elem_size) })
    }

    /// Mutable bytes of element `idx`
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut [u8]> {
        if idx >= self.size {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(self.slot_ptr(idx), self.elem_size) })
    }

    /// Append a copy of `elem`, growing the buffer when full
    pub fn push(&mut self, elem: &[u8]) -> Result<()> {
        if elem.len() != self.elem_size {
            return Err(Error::InvalidArgument("element size mismatch"));
        }
        self.push_raw(|dst| unsafe {
            ptr::copy_nonoverlapping(elem.as_ptr(), dst, elem.len());
        })
    }

    /// Remove the last element, copying it into `out` when given.
    ///
    /// Returns `false` if the array was empty.
    pub fn pop(&mut self, out: Option<&mut [u8]>) -> bool {
        let elem_size = self.elem_size;
        self.pop_raw(|src| {
            if let Some(out) = out {
                let n = out.len().min(elem_size);
                unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), n) };
            }
        })
    }

    /// Grow capacity to `new_capacity` elements. Smaller requests are no-ops.
    pub fn extend(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity {
            return Ok(());
        }
        self.reallocate(new_capacity)
    }

    /// Reduce capacity towards `target`, never below the current length.
    /// An empty array releases its buffer entirely.
    pub fn shrink(&mut self, target: usize) -> Result<()> {
        if self.size == 0 {
            self.free_buf();
            return Ok(());
        }
        let target = target.max(self.size);
        if target >= self.capacity {
            return Ok(());
        }
        self.reallocate(target)
    }

    pub fn shrink_to_fit(&mut self) -> Result<()> {
        self.shrink(self.size)
    }

    /// Drop all elements and the buffer
    pub fn free(&mut self) {
        self.free_buf();
        self.size = 0;
    }

    /// Make room for one more element, let `write` fill it, then count it.
    pub(crate) fn push_raw(&mut self, write: impl FnOnce(*mut u8)) -> Result<()> {
        if self.size >= self.capacity {
            let grown = if self.capacity < MIN_CAPACITY {
                MIN_CAPACITY
            } else {
                self.capacity.checked_mul(2).ok_or(Error::CapacityOverflow)?
            };
            self.extend(grown)?;
        }
        write(self.slot_ptr(self.size));
        self.size += 1;
        Ok(())
    }

    /// Let `read` see the last element, then remove it and apply the
    /// shrink policy.
    pub(crate) fn pop_raw(&mut self, read: impl FnOnce(*const u8)) -> bool {
        if self.size == 0 {
            return false;
        }
        let last = self.slot_ptr(self.size - 1);
        read(last);
        unsafe { ptr::write_bytes(last, 0, self.elem_size) };
        self.size -= 1;

        if self.size == 0 {
            self.free_buf();
        } else if self.capacity >= MIN_CAPACITY && self.size <= self.capacity / 4 {
            // Keeping the larger buffer is harmless.
            let _ = self.shrink((self.capacity / 2).max(self.size));
        }
        true
    }

    fn layout(&self, elems: usize) -> Result<Layout> {
        let bytes = elems.checked_mul(self.elem_size).ok_or(Error::CapacityOverflow)?;
        Layout::from_size_align(bytes, BUF_ALIGN).map_err(|_| Error::CapacityOverflow)
    }

    fn alloc_buf(&self, elems: usize) -> Result<NonNull<u8>> {
        let layout = self.layout(elems)?;
        self.heap.allocate(layout).ok_or(Error::OutOfMemory)
    }

    fn free_buf(&mut self) {
        if let Some(data) = self.data.take() {
            // This layout was valid when the buffer was allocated.
            if let Ok(layout) = self.layout(self.capacity) {
                unsafe { self.heap.deallocate(data, layout) };
            }
        }
        self.capacity = 0;
    }

    /// Move the live elements into a fresh buffer of `new_capacity`
    fn reallocate(&mut self, new_capacity: usize) -> Result<()> {
        let new_data = self.alloc_buf(new_capacity)?;
        if let Some(old) = self.data {
            // size <= capacity, whose byte size was already checked.
            let used = self.size * self.elem_size;
            unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new_data.as_ptr(), used) };
        }
        self.free_buf();
        self.data = Some(new_data);
        self.capacity = new_capacity;
        Ok(())
    }

    /// Start of element `idx`; `idx` must be below `capacity`
    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.capacity);
        match self.data {
            Some(data) => unsafe { data.as_ptr().add(idx * self.elem_size) },
            None => ptr::null_mut(),
        }
    }
}

impl<H: HeapAllocator> Drop for DynamicArray<H> {
    fn drop(&mut self) {
        self.free_buf();
    }
}

/// `DynamicArray` holding values of a `Copy` type
pub struct TypedArray<T: Copy, H: HeapAllocator> {
    raw: DynamicArray<H>,
    _marker: PhantomData<T>,
}

impl<T: Copy, H: HeapAllocator> TypedArray<T, H> {
    pub fn new(heap: H) -> Result<Self> {
        const { assert!(mem::align_of::<T>() <= BUF_ALIGN) };
        Ok(Self {
            raw: DynamicArray::new(mem::size_of::<T>(), heap)?,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    pub fn get(&self, idx: usize) -> Option<T> {
        let bytes = self.raw.get(idx)?;
        // Buffers are BUF_ALIGN-aligned and the stride is size_of::<T>().
        Some(unsafe { ptr::read(bytes.as_ptr() as *const T) })
    }

    /// Overwrite element `idx`; returns `false` when out of range
    pub fn set(&mut self, idx: usize, value: T) -> bool {
        match self.raw.get_mut(idx) {
            Some(bytes) => {
                unsafe { ptr::write(bytes.as_mut_ptr() as *mut T, value) };
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.raw.push_raw(|dst| unsafe { ptr::write(dst as *mut T, value) })
    }

    pub fn pop(&mut self) -> Option<T> {
        let mut out = MaybeUninit::<T>::uninit();
        if self.raw.pop_raw(|src| unsafe {
            out.write(ptr::read(src as *const T));
        }) {
            Some(unsafe { out.assume_init() })
        } else {
            None
        }
    }

    pub fn shrink_to_fit(&mut self) -> Result<()> {
        self.raw.shrink_to_fit()
    }
}

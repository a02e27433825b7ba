//! Process descriptor pool
//!
//! The slot table maps a slot index to its descriptor. It only ever grows:
//! once a descriptor has been created at an index it stays there, and a
//! reaped process gives back its index, not its memory. Recyclable indices
//! sit on a separate free stack. A `None` entry is an index that was
//! reserved but whose descriptor could not be created yet.
//!
//! Both arrays live behind one leaf lock that is only held for the few
//! instructions it takes to read or mutate them. Descriptor state is
//! protected by each descriptor's own lock.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use nos_api::memory::{TRAMPOLINE, TRAPFRAME};
use nos_api::{Error, HeapAllocator, Platform, Result};

use crate::collections::TypedArray;
use crate::cpu::Machine;
use crate::sync::IrqMutex;

use super::proc::{Proc, ProcState, Slot};

struct SlotTable<P: Platform> {
    slots: TypedArray<Option<NonNull<Proc<P>>>, P::Heap>,
    free: TypedArray<usize, P::Heap>,
}

// Descriptors are shared through the table, never moved out of it.
unsafe impl<P: Platform> Send for SlotTable<P> {}

pub struct ProcPool<P: Platform> {
    table: IrqMutex<SlotTable<P>>,
    /// Descriptors holding a reservation against `max`
    live: AtomicUsize,
    max: usize,
    heap: P::Heap,
}

impl<P: Platform> ProcPool<P> {
    pub fn new(heap: P::Heap, max: usize) -> Result<Self> {
        Ok(Self {
            table: IrqMutex::new(SlotTable {
                slots: TypedArray::new(heap.clone())?,
                free: TypedArray::new(heap.clone())?,
            }),
            live: AtomicUsize::new(0),
            max,
            heap,
        })
    }

    /// Get an `Unused` descriptor, returned locked.
    ///
    /// The caller must either finish initializing it or hand it to
    /// `release`. Fails with `ProcessTableFull` at the live-process limit
    /// and with `OutOfMemory` when no new descriptor can be created.
    pub fn allocate(&self, m: &Machine<P>) -> Result<&Proc<P>> {
        self.reserve()?;
        match self.take_slot(m) {
            Ok(p) => {
                p.set_reserved();
                Ok(p)
            }
            Err(e) => {
                self.unreserve();
                log::warn!("proc: no descriptor available: {}", e);
                Err(e)
            }
        }
    }

    fn take_slot(&self, m: &Machine<P>) -> Result<&Proc<P>> {
        // Recycled indices first.
        loop {
            let (idx, entry) = {
                let mut t = self.table.lock(m);
                let Some(idx) = t.free.pop() else { break };
                (idx, t.slots.get(idx).flatten())
            };
            match entry {
                Some(ptr) => {
                    let p = unsafe { ptr.as_ref() };
                    p.lock.acquire(m);
                    if p.state() == ProcState::Unused {
                        return Ok(p);
                    }
                    // Lost a race; the index belongs to a live process again.
                    p.lock.release(m);
                }
                None => return self.materialize(m, idx),
            }
        }

        // Nothing to recycle: append a new slot.
        let idx = {
            let mut t = self.table.lock(m);
            let idx = t.slots.len();
            t.slots.push(None)?;
            idx
        };
        self.materialize(m, idx)
    }

    /// Create the descriptor for reserved index `idx` and return it locked
    fn materialize(&self, m: &Machine<P>, idx: usize) -> Result<&Proc<P>> {
        let layout = Layout::new::<Proc<P>>();
        let Some(mem) = self.heap.allocate(layout) else {
            self.recycle(m, Slot(idx));
            return Err(Error::OutOfMemory);
        };
        let ptr = mem.cast::<Proc<P>>();
        unsafe { ptr.as_ptr().write(Proc::new(Slot(idx))) };
        let p = unsafe { ptr.as_ref() };
        p.lock.acquire(m);
        self.table.lock(m).slots.set(idx, Some(ptr));
        Ok(p)
    }

    fn reserve(&self) -> Result<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::ProcessTableFull)
    }

    fn unreserve(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Free a descriptor's resources and mark it `Unused` ("freeproc").
    ///
    /// Caller holds `p.lock`. Resources already released are skipped. The
    /// slot index is not recycled here; see `recycle`.
    pub fn release(&self, m: &Machine<P>, p: &Proc<P>) {
        if !p.lock.holding(m) {
            panic!("freeproc: not holding proc lock");
        }
        let platform = m.platform();
        let data = unsafe { &mut *p.data() };

        if let Some(kstack) = data.kstack.take() {
            unsafe { platform.free_page(kstack) };
        }
        if let Some(tf) = data.trapframe.take() {
            unsafe { platform.free_page(tf.cast()) };
        }
        if let Some(mut space) = data.space.take() {
            platform.unmap_pages(&mut space, TRAMPOLINE, 1, false);
            platform.unmap_pages(&mut space, TRAPFRAME, 1, false);
            platform.destroy_address_space(space, p.size());
        }

        p.reset();
        if p.take_reserved() {
            self.unreserve();
        }
    }

    /// Make a slot index available to `allocate` again
    pub fn recycle(&self, m: &Machine<P>, slot: Slot) {
        if self.table.lock(m).free.push(slot.0).is_err() {
            // The descriptor stays in the table; only its reuse is lost.
            log::warn!("proc: could not recycle slot {}", slot.0);
        }
    }

    pub fn get(&self, m: &Machine<P>, slot: Slot) -> Option<&Proc<P>> {
        let ptr = self.table.lock(m).slots.get(slot.0).flatten()?;
        Some(unsafe { ptr.as_ref() })
    }

    /// Reserved or materialized slots
    pub fn slot_count(&self, m: &Machine<P>) -> usize {
        self.table.lock(m).slots.len()
    }

    /// Descriptors counted against the limit
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Every materialized descriptor, in slot order.
    ///
    /// The table lock is taken once per step, so slots appended during the
    /// walk are still visited.
    pub fn iter<'a>(&'a self, m: &'a Machine<P>) -> impl Iterator<Item = &'a Proc<P>> + 'a {
        let mut idx = 0;
        core::iter::from_fn(move || {
            loop {
                let entry = {
                    let t = self.table.lock(m);
                    if idx >= t.slots.len() {
                        return None;
                    }
                    t.slots.get(idx).flatten()
                };
                idx += 1;
                if let Some(ptr) = entry {
                    return Some(unsafe { ptr.as_ref() });
                }
            }
        })
    }
}

impl<P: Platform> Drop for ProcPool<P> {
    fn drop(&mut self) {
        let t = self.table.get_mut();
        let layout = Layout::new::<Proc<P>>();
        for idx in 0..t.slots.len() {
            if let Some(ptr) = t.slots.get(idx).flatten() {
                unsafe {
                    core::ptr::drop_in_place(ptr.as_ptr());
                    self.heap.deallocate(ptr.cast(), layout);
                }
            }
        }
    }
}


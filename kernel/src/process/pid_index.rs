//! Pid to descriptor index
//!
//! A fixed number of buckets keyed by `pid % buckets`, one descriptor per
//! bucket, last writer wins. Entries are written when a pid is assigned or
//! retired and read without locking; every hit is checked against the
//! descriptor's current pid. A miss proves nothing, so callers fall back to
//! scanning the pool.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use nos_api::{Pid, Platform};

use super::proc::Proc;

pub struct PidIndex<P: Platform> {
    buckets: Box<[AtomicPtr<Proc<P>>]>,
}

impl<P: Platform> PidIndex<P> {
    pub fn new(buckets: usize) -> Self {
        let buckets: Vec<AtomicPtr<Proc<P>>> =
            (0..buckets.max(1)).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    #[inline]
    fn bucket(&self, pid: Pid) -> &AtomicPtr<Proc<P>> {
        &self.buckets[pid % self.buckets.len()]
    }

    /// Index `p` under its current pid
    pub fn add(&self, p: &Proc<P>) {
        self.bucket(p.pid())
            .store(p as *const Proc<P> as *mut Proc<P>, Ordering::Release);
    }

    /// Drop `p`'s entry, unless a newer process already took the bucket
    pub fn remove(&self, p: &Proc<P>) {
        let me = p as *const Proc<P> as *mut Proc<P>;
        let _ = self.bucket(p.pid()).compare_exchange(
            me,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Descriptor currently indexed under `pid`, if its pid still matches.
    ///
    /// Only pointers to descriptors owned by the same process table are
    /// ever stored, and those outlive the index.
    pub fn lookup(&self, pid: Pid) -> Option<&Proc<P>> {
        if pid == 0 {
            return None;
        }
        let raw = self.bucket(pid).load(Ordering::Acquire);
        let p = unsafe { raw.as_ref() }?;
        (p.pid() == pid).then_some(p)
    }
}

// Synchronization primitives for the process core
// Provides SpinLock (explicit acquire/release) and IrqMutex (guarded data)
//
// Both disable interrupts on the local CPU for as long as they are held, so
// an interrupt handler can never spin on a lock its own CPU already owns.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nos_api::Platform;

use crate::cpu::Machine;

/// Owner value of an unheld lock
const NO_CPU: usize = usize::MAX;

// ============================================================================
// SpinLock - named lock with explicit acquire/release
// ============================================================================

/// Mutual-exclusion lock with owner tracking.
///
/// Unlike a guard-based mutex the lock is released by an explicit call,
/// which lets the context switch protocol acquire it in one kernel thread
/// and release it in another running on the same CPU.
pub struct SpinLock {
    name: &'static str,
    locked: AtomicBool,
    // CPU holding the lock, for holding() checks
    cpu: AtomicUsize,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spin until the lock is ours. Interrupts stay off until the matching
    /// `release`.
    pub fn acquire<P: Platform>(&self, m: &Machine<P>) {
        m.push_off();
        if self.holding(m) {
            panic!("acquire {}", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.cpu.store(m.cpu_id(), Ordering::Relaxed);
    }

    pub fn release<P: Platform>(&self, m: &Machine<P>) {
        if !self.holding(m) {
            panic!("release {}", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        m.pop_off();
    }

    /// Is this CPU holding the lock? Interrupts must be off.
    pub fn holding<P: Platform>(&self, m: &Machine<P>) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == m.cpu_id()
    }
}

// ============================================================================
// IrqMutex - spin::Mutex with interrupts disabled while held
// ============================================================================

/// Data lock for short critical sections that never switch contexts
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock<'a, P: Platform>(&'a self, m: &'a Machine<P>) -> IrqMutexGuard<'a, T, P> {
        m.push_off();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            machine: m,
        }
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqMutexGuard<'a, T, P: Platform> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    machine: &'a Machine<P>,
}

impl<T, P: Platform> Deref for IrqMutexGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, P: Platform> DerefMut for IrqMutexGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, P: Platform> Drop for IrqMutexGuard<'_, T, P> {
    fn drop(&mut self) {
        // Unlock first, then restore the interrupt state.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.machine.pop_off();
    }
}

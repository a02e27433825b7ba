// Per-CPU state
// Current process, scheduler context and interrupt-disable nesting

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use nos_api::{Context, Platform};

use crate::process::Slot;

/// Per-CPU state
pub struct Cpu {
    /// The process running on this CPU, or None
    proc: Option<Slot>,
    /// Saved scheduler context; `sched` switches here
    context: Context,
    /// Depth of push_off nesting
    noff: usize,
    /// Were interrupts enabled before the outermost push_off?
    intena: bool,
}

impl Cpu {
    fn new() -> Self {
        Self {
            proc: None,
            context: Context::default(),
            noff: 0,
            intena: false,
        }
    }
}

/// The platform plus the table of per-CPU state.
///
/// Each CPU only touches its own entry, and only with interrupts disabled,
/// so the entries live in `UnsafeCell`s without a lock.
pub struct Machine<P: Platform> {
    platform: P,
    cpus: Box<[UnsafeCell<Cpu>]>,
}

unsafe impl<P: Platform> Sync for Machine<P> {}

impl<P: Platform> Machine<P> {
    pub fn new(platform: P, ncpu: usize) -> Self {
        let cpus: Vec<UnsafeCell<Cpu>> = (0..ncpu).map(|_| UnsafeCell::new(Cpu::new())).collect();
        Self {
            platform,
            cpus: cpus.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    /// Id of the executing CPU.
    /// Must be called with interrupts disabled.
    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.platform.cpu_id()
    }

    /// This CPU's state. Interrupts must be disabled.
    fn mycpu(&self) -> *mut Cpu {
        let id = self.cpu_id();
        match self.cpus.get(id) {
            Some(cpu) => cpu.get(),
            None => panic!("mycpu: cpu {} out of range", id),
        }
    }

    /// push_off/pop_off are like intr_off()/intr_on() except that they are
    /// matched: it takes two pop_off()s to undo two push_off()s. Also, if
    /// interrupts are initially off, then push_off, pop_off leaves them off.
    pub fn push_off(&self) {
        let old = self.platform.intr_get();
        self.platform.intr_off();
        let c = self.mycpu();
        unsafe {
            if (*c).noff == 0 {
                (*c).intena = old;
            }
            (*c).noff += 1;
        }
    }

    pub fn pop_off(&self) {
        if self.platform.intr_get() {
            panic!("pop_off - interruptible");
        }
        let c = self.mycpu();
        unsafe {
            if (*c).noff < 1 {
                panic!("pop_off");
            }
            (*c).noff -= 1;
            if (*c).noff == 0 && (*c).intena {
                self.platform.intr_on();
            }
        }
    }

    /// Slot of the process running on this CPU
    pub fn current(&self) -> Option<Slot> {
        self.push_off();
        let slot = unsafe { (*self.mycpu()).proc };
        self.pop_off();
        slot
    }

    // The accessors below require interrupts to be disabled.

    pub(crate) fn set_current(&self, slot: Option<Slot>) {
        unsafe { (*self.mycpu()).proc = slot };
    }

    pub(crate) fn noff(&self) -> usize {
        unsafe { (*self.mycpu()).noff }
    }

    pub(crate) fn intena(&self) -> bool {
        unsafe { (*self.mycpu()).intena }
    }

    pub(crate) fn set_intena(&self, intena: bool) {
        unsafe { (*self.mycpu()).intena = intena };
    }

    pub(crate) fn scheduler_context(&self) -> *mut Context {
        unsafe { &raw mut (*self.mycpu()).context }
    }
}

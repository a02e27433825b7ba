//! Process descriptor
//!
//! A descriptor is heap-allocated once, when its slot is first used, and is
//! then recycled for every process that later occupies the slot. Its address
//! therefore stays valid for the lifetime of the process table, which is
//! what lets wait channels, the pid index and per-CPU state refer to it.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use nos_api::memory::page_round_up;
use nos_api::{Context, FileOps, PAGE_SIZE, Pid, Platform, TrapFrame};

use crate::config::{NOFILE, PROC_NAME_LEN};
use crate::sync::SpinLock;

/// Process name, truncated to `PROC_NAME_LEN` bytes
pub type ProcName = heapless::String<PROC_NAME_LEN>;

// ============================================================================
// Types
// ============================================================================

/// Process state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused = 0,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProcState::Used,
            2 => ProcState::Sleeping,
            3 => ProcState::Runnable,
            4 => ProcState::Running,
            5 => ProcState::Zombie,
            _ => ProcState::Unused,
        }
    }

    /// Fixed-width label used by the process table dump
    pub fn label(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Used => "used",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Index of a descriptor in the process table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub(crate) usize);

impl Slot {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Rendezvous key shared by `sleep` and `wakeup`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// Channel named by the address of `obj`
    pub fn of<T>(obj: &T) -> Self {
        Self(obj as *const T as usize)
    }

    /// Channel named by an arbitrary key
    pub const fn from_raw(key: usize) -> Self {
        Self(key)
    }
}

/// Guarded by `Proc::lock`
struct ProcInner {
    chan: Option<WaitChannel>,
    xstate: i32,
    // counted against the live-process limit
    reserved: bool,
}

/// Parent/child links, guarded by the table's wait lock.
///
/// A parent owns the singly linked list that starts at `first_child` and
/// continues through each child's `next_sibling`.
pub(crate) struct Family {
    pub(crate) parent: Option<Slot>,
    pub(crate) first_child: Option<Slot>,
    pub(crate) next_sibling: Option<Slot>,
}

/// Resources private to the process.
///
/// Touched by the process itself while it runs, and by whoever holds
/// `Proc::lock` while it does not (creation, fork, reaping).
pub(crate) struct ProcData<P: Platform> {
    pub(crate) kstack: Option<NonNull<u8>>,
    pub(crate) trapframe: Option<NonNull<TrapFrame>>,
    pub(crate) space: Option<P::AddressSpace>,
    pub(crate) ofile: [Option<<P as FileOps>::File>; NOFILE],
    pub(crate) cwd: Option<<P as FileOps>::Inode>,
    pub(crate) name: ProcName,
    pub(crate) context: Context,
}

/// Process descriptor
pub struct Proc<P: Platform> {
    /// Guards `state` transitions and everything in `ProcInner`
    pub lock: SpinLock,
    slot: Slot,

    // Written under `lock`, readable anywhere.
    pid: AtomicUsize,
    state: AtomicU8,
    killed: AtomicBool,
    size: AtomicUsize,

    // Ready-queue link, owned by the queue lock while enqueued
    run_next: AtomicUsize,

    inner: UnsafeCell<ProcInner>,
    family: UnsafeCell<Family>,
    data: UnsafeCell<ProcData<P>>,
}

unsafe impl<P: Platform> Sync for Proc<P> {}
unsafe impl<P: Platform> Send for Proc<P> {}

/// `run_next` value of a descriptor at the tail of its queue
pub(crate) const NO_LINK: usize = usize::MAX;

impl<P: Platform> Proc<P> {
    pub(crate) fn new(slot: Slot) -> Self {
        Self {
            lock: SpinLock::new("proc"),
            slot,
            pid: AtomicUsize::new(0),
            state: AtomicU8::new(ProcState::Unused as u8),
            killed: AtomicBool::new(false),
            size: AtomicUsize::new(0),
            run_next: AtomicUsize::new(NO_LINK),
            inner: UnsafeCell::new(ProcInner {
                chan: None,
                xstate: 0,
                reserved: false,
            }),
            family: UnsafeCell::new(Family {
                parent: None,
                first_child: None,
                next_sibling: None,
            }),
            data: UnsafeCell::new(ProcData {
                kstack: None,
                trapframe: None,
                space: None,
                ofile: core::array::from_fn(|_| None),
                cwd: None,
                name: ProcName::new(),
                context: Context::default(),
            }),
        }
    }

    #[inline]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> ProcState {
        ProcState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Caller holds `lock`
    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Ask the process to terminate at its next check
    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// User memory size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    /// This process's trap frame page, present from creation until reaped
    pub fn trapframe(&self) -> Option<NonNull<TrapFrame>> {
        unsafe { (*self.data.get()).trapframe }
    }

    // The accessors below require `lock` to be held.

    pub(crate) fn chan(&self) -> Option<WaitChannel> {
        unsafe { (*self.inner.get()).chan }
    }

    pub(crate) fn set_chan(&self, chan: Option<WaitChannel>) {
        unsafe { (*self.inner.get()).chan = chan };
    }

    pub(crate) fn xstate(&self) -> i32 {
        unsafe { (*self.inner.get()).xstate }
    }

    pub(crate) fn set_xstate(&self, xstate: i32) {
        unsafe { (*self.inner.get()).xstate = xstate };
    }

    pub(crate) fn set_reserved(&self) {
        unsafe { (*self.inner.get()).reserved = true };
    }

    /// Clear the reservation flag, returning whether it was set
    pub(crate) fn take_reserved(&self) -> bool {
        unsafe { core::mem::replace(&mut (*self.inner.get()).reserved, false) }
    }

    /// Fields reset when a descriptor goes back to `Unused`
    pub(crate) fn reset(&self) {
        self.set_size(0);
        self.set_pid(0);
        self.killed.store(false, Ordering::Release);
        unsafe {
            let inner = &mut *self.inner.get();
            inner.chan = None;
            inner.xstate = 0;
            (*self.family.get()).parent = None;
            (*self.data.get()).name.clear();
        }
        self.set_state(ProcState::Unused);
    }

    /// Copy of the name; caller holds `lock`
    pub(crate) fn name(&self) -> ProcName {
        unsafe { (*self.data.get()).name.clone() }
    }

    /// Caller holds the table's wait lock
    pub(crate) fn family(&self) -> *mut Family {
        self.family.get()
    }

    /// See `ProcData` for who may dereference this
    pub(crate) fn data(&self) -> *mut ProcData<P> {
        self.data.get()
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        unsafe { &raw mut (*self.data.get()).context }
    }

    // Ready-queue link; caller holds the lock of the queue it is on.

    pub(crate) fn run_next(&self) -> usize {
        self.run_next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_run_next(&self, next: usize) {
        self.run_next.store(next, Ordering::Relaxed);
    }

    /// Pages held by the process: user memory plus kernel stack and trap
    /// frame. Caller holds `lock`.
    pub(crate) fn page_count(&self) -> usize {
        let data = unsafe { &*self.data.get() };
        page_round_up(self.size()) / PAGE_SIZE
            + usize::from(data.kstack.is_some())
            + usize::from(data.trapframe.is_some())
    }
}


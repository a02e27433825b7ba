//! Process table
//!
//! `ProcTable` ties the descriptor pool, the pid index and the ready queues
//! to the machine they run on. Lifecycle operations (fork, exit, wait) live
//! in `lifecycle.rs`; dispatch, sleep and wakeup in `sched::scheduler`.
//!
//! Lock order, outermost first:
//!
//! 1. `wait_lock` (parent/child links)
//! 2. a descriptor's `lock`
//! 3. a ready-queue lock, or the pid counter
//! 4. the slot-table lock
//!
//! Two descriptor locks are never held at once, except by the scheduler,
//! which holds the running process's lock across the switch on its behalf.

use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;

use nos_api::{Error, FileOps, Pid, Platform, Result};
use spin::Once;

use crate::config::ProcConfig;
use crate::cpu::Machine;
use crate::sched::ReadyQueues;
use crate::sync::{IrqMutex, SpinLock};

use super::pid_index::PidIndex;
use super::pool::ProcPool;
use super::proc::{Proc, ProcName, ProcState, Slot};

// ============================================================================
// Types
// ============================================================================

/// One row of the process listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub state: ProcState,
    pub name: ProcName,
    pub parent: Option<Pid>,
    pub slot: Slot,
}

/// Process table
pub struct ProcTable<P: Platform> {
    pub(crate) machine: Machine<P>,
    pub(crate) pool: ProcPool<P>,
    pub(crate) pids: PidIndex<P>,
    pub(crate) queues: ReadyQueues,
    /// Serializes parent/child link changes; taken before any process lock
    pub(crate) wait_lock: SpinLock,
    next_pid: IrqMutex<Pid>,
    pub(crate) init: Once<Slot>,
    /// Set by the first process to reach `forkret`
    pub(crate) fs_started: AtomicBool,
    config: ProcConfig,
}

// ============================================================================
// Construction and lookup
// ============================================================================

impl<P: Platform> ProcTable<P> {
    /// Build an empty table for `platform` ("procinit")
    pub fn new(platform: P, config: ProcConfig) -> Result<Self> {
        config.validate()?;
        let heap = platform.heap();
        let table = Self {
            machine: Machine::new(platform, config.ncpu),
            pool: ProcPool::new(heap, config.max_procs)?,
            pids: PidIndex::new(config.pid_buckets),
            queues: ReadyQueues::new(config.ncpu, config.placement),
            wait_lock: SpinLock::new("wait_lock"),
            next_pid: IrqMutex::new(1),
            init: Once::new(),
            fs_started: AtomicBool::new(false),
            config,
        };
        log::info!(
            "proc: table ready (max {} procs, {} cpus, {:?} placement)",
            config.max_procs,
            config.ncpu,
            config.placement
        );
        Ok(table)
    }

    #[inline]
    pub fn machine(&self) -> &Machine<P> {
        &self.machine
    }

    #[inline]
    pub fn platform(&self) -> &P {
        self.machine.platform()
    }

    #[inline]
    pub fn config(&self) -> &ProcConfig {
        &self.config
    }

    /// The process running on this CPU, or None
    pub fn myproc(&self) -> Option<&Proc<P>> {
        let slot = self.machine.current()?;
        self.pool.get(&self.machine, slot)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.myproc().map(|p| p.pid())
    }

    /// The first process, which adopts orphans
    pub fn init_proc(&self) -> Option<&Proc<P>> {
        let slot = *self.init.get()?;
        self.pool.get(&self.machine, slot)
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock(&self.machine);
        let pid = *next;
        *next += 1;
        pid
    }

    /// Descriptor currently carrying `pid`, found through the index or, on
    /// a miss, by scanning the pool. The result is unlocked and may be
    /// reaped at any time; lock it and recheck the pid before relying on it.
    pub fn find(&self, pid: Pid) -> Option<&Proc<P>> {
        if pid == 0 {
            return None;
        }
        self.pids
            .lookup(pid)
            .or_else(|| self.pool.iter(&self.machine).find(|p| p.pid() == pid))
    }

    /// Run `f` on the live process `pid` with its lock held
    pub(crate) fn with_locked<R>(&self, pid: Pid, f: impl FnOnce(&Proc<P>) -> R) -> Option<R> {
        if pid == 0 {
            return None;
        }
        let m = &self.machine;
        let mut f = Some(f);
        let hit = self.pids.lookup(pid).into_iter();
        let scan = self.pool.iter(m).filter(|p| p.pid() == pid);
        for p in hit.chain(scan) {
            p.lock.acquire(m);
            if p.pid() == pid && p.state() != ProcState::Unused {
                let r = f.take().map(|f| f(p));
                p.lock.release(m);
                return r;
            }
            p.lock.release(m);
        }
        None
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Descriptors that are not `Unused`
    pub fn live_count(&self) -> usize {
        self.pool.live_count()
    }

    /// Slots ever handed out, including ones now free
    pub fn slot_count(&self) -> usize {
        self.pool.slot_count(&self.machine)
    }

    /// Processes waiting on `cpu`'s ready queue
    pub fn queued(&self, cpu: usize) -> usize {
        self.queues.len(cpu)
    }

    /// Consistent listing of every live process.
    /// Must not be called with `wait_lock` or a process lock held.
    pub fn snapshot(&self) -> Vec<ProcInfo> {
        let m = &self.machine;
        let mut rows = Vec::new();
        self.wait_lock.acquire(m);
        for p in self.pool.iter(m) {
            p.lock.acquire(m);
            let state = p.state();
            if state != ProcState::Unused {
                let parent = unsafe { (*p.family()).parent }
                    .and_then(|s| self.pool.get(m, s))
                    .map(|pp| pp.pid());
                rows.push(ProcInfo {
                    pid: p.pid(),
                    state,
                    name: p.name(),
                    parent,
                    slot: p.slot(),
                });
            }
            p.lock.release(m);
        }
        self.wait_lock.release(m);
        rows
    }

    /// Listing row for `pid`
    pub fn proc_info(&self, pid: Pid) -> Option<ProcInfo> {
        self.snapshot().into_iter().find(|row| row.pid == pid)
    }

    /// Print the process list to the log ("procdump")
    pub fn dump_process_table(&self) {
        for row in self.snapshot() {
            log::info!("{} {} {}", row.pid, row.state.label(), row.name);
        }
    }

    /// Pages attributed to `pid`: user memory, kernel stack and trap frame
    pub fn alloc_stat(&self, pid: Pid) -> Result<usize> {
        self.with_locked(pid, |p| p.page_count()).ok_or(Error::NotFound)
    }

    // ========================================================================
    // Kill flag
    // ========================================================================

    pub fn set_killed(&self, p: &Proc<P>) {
        p.set_killed();
    }

    pub fn is_killed(&self, p: &Proc<P>) -> bool {
        p.is_killed()
    }

    /// Has the current process been killed?
    pub fn killed(&self) -> bool {
        self.myproc().is_some_and(|p| p.is_killed())
    }

    // ========================================================================
    // Open files of the current process
    // ========================================================================

    /// Install `file` in the lowest free descriptor of the current process
    pub fn fd_alloc(&self, file: <P as FileOps>::File) -> Result<usize> {
        let Some(p) = self.myproc() else {
            self.platform().close_file(file);
            return Err(Error::NoProcess);
        };
        let data = unsafe { &mut *p.data() };
        match data.ofile.iter().position(Option::is_none) {
            Some(fd) => {
                data.ofile[fd] = Some(file);
                Ok(fd)
            }
            None => {
                self.platform().close_file(file);
                Err(Error::InvalidArgument("no free file descriptor"))
            }
        }
    }

    /// Close descriptor `fd` of the current process
    pub fn fd_close(&self, fd: usize) -> Result<()> {
        let p = self.myproc().ok_or(Error::NoProcess)?;
        let data = unsafe { &mut *p.data() };
        let file = data
            .ofile
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(Error::InvalidArgument("bad file descriptor"))?;
        self.platform().close_file(file);
        Ok(())
    }
}

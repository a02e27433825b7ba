//! Dispatch loop and the sleep/wakeup rendezvous
//!
//! A process gives up its CPU only through `sched`, holding its own lock
//! and nothing else. The scheduler that switched to it releases that lock
//! on its behalf, and the next scheduler to pick it up reacquires it before
//! switching back in.

use nos_api::{Error, Pid, Platform, Result};

use crate::process::{Proc, ProcState, ProcTable, WaitChannel};
use crate::sync::SpinLock;

impl<P: Platform> ProcTable<P> {
    /// Per-CPU scheduler loop. Each CPU calls this after setting itself up
    /// and never returns.
    ///
    /// - take the next process from this CPU's ready queue
    /// - switch to it
    /// - eventually it switches back here via `sched`
    pub fn scheduler(&self) -> ! {
        let m = &self.machine;
        let platform = self.platform();
        m.push_off();
        let cpu = m.cpu_id();
        m.set_current(None);
        m.pop_off();
        log::info!("sched: cpu {} online", cpu);

        loop {
            // Let devices interrupt while the queue is empty.
            platform.intr_on();

            let Some(p) = self.queues.dequeue(m, &self.pool, cpu) else {
                platform.wait_for_interrupt();
                continue;
            };

            p.lock.acquire(m);
            if p.state() == ProcState::Runnable {
                // Switch to the chosen process. It is the process's job to
                // release its lock and then reacquire it before jumping
                // back to us.
                p.set_state(ProcState::Running);
                m.set_current(Some(p.slot()));
                unsafe { platform.switch_context(m.scheduler_context(), p.context_ptr()) };

                // Process is done running for now.
                m.set_current(None);
            }
            p.lock.release(m);
        }
    }

    /// Switch to this CPU's scheduler.
    ///
    /// Must hold only `p.lock` and have already changed `p`'s state.
    /// Saves and restores `intena` because it is a property of this kernel
    /// thread, not this CPU.
    pub(crate) fn sched(&self, p: &Proc<P>) {
        let m = &self.machine;
        let platform = self.platform();
        if !p.lock.holding(m) {
            panic!("sched p->lock");
        }
        if m.noff() != 1 {
            panic!("sched locks");
        }
        if p.state() == ProcState::Running {
            panic!("sched running");
        }
        if platform.intr_get() {
            panic!("sched interruptible");
        }

        let intena = m.intena();
        unsafe { platform.switch_context(p.context_ptr(), m.scheduler_context()) };
        // Possibly resumed on another CPU.
        m.set_intena(intena);
    }

    /// Give up the CPU for one scheduling round
    pub fn yield_cpu(&self) {
        let m = &self.machine;
        let Some(p) = self.myproc() else {
            return;
        };
        p.lock.acquire(m);
        p.set_state(ProcState::Runnable);
        self.queues.enqueue(m, &self.pool, p);
        self.sched(p);
        p.lock.release(m);
    }

    /// Atomically release `lk` and sleep on `chan`. Reacquires `lk` when
    /// awakened.
    pub fn sleep(&self, chan: WaitChannel, lk: &SpinLock) {
        let m = &self.machine;
        let Some(p) = self.myproc() else {
            panic!("sleep: no process");
        };

        // Once we hold p.lock we are guaranteed not to miss a wakeup, since
        // wakeup locks p.lock, so it is okay to release lk.
        p.lock.acquire(m);
        lk.release(m);

        p.set_chan(Some(chan));
        p.set_state(ProcState::Sleeping);

        self.sched(p);

        p.set_chan(None);

        p.lock.release(m);
        lk.acquire(m);
    }

    /// Wake every process sleeping on `chan`.
    /// Must be called without any process lock held.
    pub fn wakeup(&self, chan: WaitChannel) {
        let m = &self.machine;
        let me = self.myproc().map(|p| p.slot());
        let mut woken = 0usize;
        for p in self.pool.iter(m) {
            if Some(p.slot()) == me {
                continue;
            }
            p.lock.acquire(m);
            if p.state() == ProcState::Sleeping && p.chan() == Some(chan) {
                p.set_state(ProcState::Runnable);
                self.queues.enqueue(m, &self.pool, p);
                woken += 1;
            }
            p.lock.release(m);
        }
        if woken > 0 {
            log::trace!("sched: woke {} on {:?}", woken, chan);
        }
    }

    /// Kill the process with the given pid.
    ///
    /// The victim won't exit until it tries to return to user space; a
    /// sleeping victim is made runnable so it gets there.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        let m = &self.machine;
        self.with_locked(pid, |p| {
            p.set_killed();
            if p.state() == ProcState::Sleeping {
                p.set_state(ProcState::Runnable);
                self.queues.enqueue(m, &self.pool, p);
            }
        })
        .ok_or(Error::NotFound)?;
        log::debug!("proc: pid {} killed", pid);
        Ok(())
    }
}

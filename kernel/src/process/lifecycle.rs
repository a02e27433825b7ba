//! Process lifecycle
//!
//! Creation with full unwinding, fork, exit with reparenting, wait with
//! zombie reaping, and the user-boundary helpers the system calls use.

use nos_api::memory::{MAXVA, TRAMPOLINE, TRAPFRAME};
use core::sync::atomic::Ordering;

use nos_api::{Context, ContextEntry, Error, PAGE_SIZE, PhysAddr, Pid, Platform, PteFlags, Result, TrapFrame};

use super::manager::ProcTable;
use super::proc::{Proc, ProcState, WaitChannel};

/// Destination of a copy out of the kernel
pub enum CopyDst<'a> {
    /// User virtual address in the current process
    User(usize),
    /// Kernel buffer
    Kernel(&'a mut [u8]),
}

/// Source of a copy into the kernel
pub enum CopySrc<'a> {
    /// User virtual address in the current process
    User(usize),
    /// Kernel buffer
    Kernel(&'a [u8]),
}

/// Is `[va, va + len)` inside a user image of `size` bytes?
/// Checked before any page-table walk.
fn user_range_ok(size: usize, va: usize, len: usize) -> bool {
    let Some(end) = va.checked_add(len) else {
        return false;
    };
    va < MAXVA && end <= MAXVA && va < size && end <= size
}

/// A new process's first scheduling switches here. `arg` is the process
/// table the context was prepared by.
extern "C" fn forkret<P: Platform>(arg: usize) -> ! {
    let table = unsafe { &*(arg as *const ProcTable<P>) };
    table.forkret()
}

impl<P: Platform> ProcTable<P> {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Allocate a descriptor with a fresh pid, kernel stack, trap frame and
    /// user address space ("allocproc").
    ///
    /// Returns it locked and `Used`. On failure everything acquired so far
    /// is released and the slot goes back to the pool.
    pub(crate) fn create_process(&'static self) -> Result<&'static Proc<P>> {
        let p = self.pool.allocate(&self.machine)?;
        p.set_pid(self.alloc_pid());
        self.pids.add(p);
        p.set_state(ProcState::Used);

        if let Err(e) = self.attach_resources(p) {
            log::warn!("proc: creating pid {} failed: {}", p.pid(), e);
            self.discard(p);
            return Err(e);
        }
        log::debug!("proc: created pid {} in slot {}", p.pid(), p.slot().index());
        Ok(p)
    }

    fn attach_resources(&'static self, p: &Proc<P>) -> Result<()> {
        let platform = self.platform();
        let data = unsafe { &mut *p.data() };

        let kstack = platform.alloc_page().ok_or(Error::OutOfMemory)?;
        data.kstack = Some(kstack);

        let tf = platform.alloc_page().ok_or(Error::OutOfMemory)?.cast::<TrapFrame>();
        unsafe { tf.as_ptr().write(TrapFrame::default()) };
        data.trapframe = Some(tf);

        let mut space = platform.create_address_space().ok_or(Error::OutOfMemory)?;
        if let Err(e) = platform.map_pages(
            &mut space,
            TRAMPOLINE,
            PAGE_SIZE,
            platform.trampoline(),
            PteFlags::R | PteFlags::X,
        ) {
            platform.destroy_address_space(space, 0);
            return Err(e);
        }
        if let Err(e) = platform.map_pages(
            &mut space,
            TRAPFRAME,
            PAGE_SIZE,
            PhysAddr::from_ptr(tf.as_ptr()),
            PteFlags::R | PteFlags::W,
        ) {
            platform.unmap_pages(&mut space, TRAMPOLINE, 1, false);
            platform.destroy_address_space(space, 0);
            return Err(e);
        }
        data.space = Some(space);

        // Start at forkret on top of the new kernel stack.
        let entry: ContextEntry = forkret::<P>;
        data.context = Context::default();
        platform.prepare_context(
            &mut data.context,
            kstack.as_ptr() as usize + PAGE_SIZE,
            entry,
            self as *const Self as usize,
        );
        Ok(())
    }

    /// Undo `create_process` for a descriptor that is still locked and
    /// unreachable from any child list or ready queue
    fn discard(&self, p: &Proc<P>) {
        let m = &self.machine;
        self.pids.remove(p);
        self.pool.release(m, p);
        p.lock.release(m);
        self.pool.recycle(m, p.slot());
    }

    fn forkret(&self) -> ! {
        let Some(p) = self.myproc() else {
            panic!("forkret: no process");
        };
        // Still holding p.lock from the scheduler.
        p.lock.release(&self.machine);

        // File system initialization must run in the context of a regular
        // process because it may sleep. Later arrivals do not wait for it.
        if !self.fs_started.swap(true, Ordering::AcqRel) {
            self.platform().init_fs();
        }

        let Some(tf) = p.trapframe() else {
            panic!("forkret: no trapframe");
        };
        unsafe { self.platform().return_to_user(tf) }
    }

    /// Set up the first user process running `image` ("userinit")
    pub fn create_first_process(&'static self, image: &[u8]) -> Result<Pid> {
        if self.init.is_completed() {
            return Err(Error::InvalidArgument("first process already created"));
        }
        if image.len() > PAGE_SIZE {
            return Err(Error::InvalidArgument("initcode larger than a page"));
        }
        let m = &self.machine;
        let platform = self.platform();
        let p = self.create_process()?;
        let data = unsafe { &mut *p.data() };

        let loaded = match data.space.as_mut() {
            Some(space) => platform.map_first_segment(space, image),
            None => Err(Error::OutOfMemory),
        };
        if let Err(e) = loaded {
            self.discard(p);
            return Err(e);
        }
        p.set_size(PAGE_SIZE);

        // User program counter and stack pointer.
        if let Some(tf) = data.trapframe {
            let tf = unsafe { &mut *tf.as_ptr() };
            tf.epc = 0;
            tf.sp = PAGE_SIZE as u64;
        }
        let _ = data.name.push_str("initcode");
        data.cwd = platform.root_inode();

        self.init.call_once(|| p.slot());
        p.set_state(ProcState::Runnable);
        self.queues.enqueue(m, &self.pool, p);
        let pid = p.pid();
        p.lock.release(m);

        log::info!("proc: init process created (pid={})", pid);
        Ok(pid)
    }

    // ========================================================================
    // fork / exit / wait
    // ========================================================================

    /// Create a child that is a copy of the current process, returning the
    /// child's pid. The child sees 0 as the result of the same call.
    pub fn fork(&'static self) -> Result<Pid> {
        let m = &self.machine;
        let platform = self.platform();
        let p = self.myproc().ok_or(Error::NoProcess)?;
        let np = self.create_process()?;

        let pd = unsafe { &*p.data() };
        let nd = unsafe { &mut *np.data() };
        let (Some(src), Some(dst)) = (pd.space.as_ref(), nd.space.as_mut()) else {
            panic!("fork: missing address space");
        };
        // Copy user memory from parent to child.
        if let Err(e) = platform.copy_address_space(src, dst, p.size()) {
            log::warn!("proc: fork of pid {} failed: {}", p.pid(), e);
            self.discard(np);
            return Err(e);
        }
        np.set_size(p.size());

        // Copy saved user registers; fork returns 0 in the child.
        if let (Some(ptf), Some(ntf)) = (pd.trapframe, nd.trapframe) {
            unsafe {
                ntf.as_ptr().write(ptf.as_ptr().read());
                (*ntf.as_ptr()).a0 = 0;
            }
        }

        // Increment reference counts on open file descriptors.
        for (src, dst) in pd.ofile.iter().zip(nd.ofile.iter_mut()) {
            *dst = src.as_ref().map(|f| platform.dup_file(f));
        }
        nd.cwd = pd.cwd.as_ref().map(|c| platform.dup_inode(c));
        nd.name = pd.name.clone();

        let pid = np.pid();
        np.lock.release(m);

        self.wait_lock.acquire(m);
        unsafe {
            let pf = &mut *p.family();
            let nf = &mut *np.family();
            nf.parent = Some(p.slot());
            nf.next_sibling = pf.first_child;
            pf.first_child = Some(np.slot());
        }
        self.wait_lock.release(m);

        np.lock.acquire(m);
        np.set_state(ProcState::Runnable);
        self.queues.enqueue(m, &self.pool, np);
        np.lock.release(m);

        log::debug!("proc: pid {} forked pid {}", p.pid(), pid);
        Ok(pid)
    }

    /// Hand `p`'s children to init. Caller holds `wait_lock`.
    fn reparent(&self, p: &Proc<P>) {
        let m = &self.machine;
        let family = unsafe { &mut *p.family() };
        let Some(first) = family.first_child.take() else {
            return;
        };
        let Some(init) = self.init_proc() else {
            panic!("reparent: no init process");
        };

        let mut last = None;
        let mut cur = Some(first);
        while let Some(slot) = cur {
            let Some(c) = self.pool.get(m, slot) else {
                panic!("reparent: stale child slot {}", slot.index());
            };
            let cf = unsafe { &mut *c.family() };
            c.lock.acquire(m);
            cf.parent = Some(init.slot());
            c.lock.release(m);
            cur = cf.next_sibling;
            last = Some(c);
        }

        // Splice the whole list onto the front of init's children.
        if let Some(last) = last {
            unsafe {
                let init_family = &mut *init.family();
                (*last.family()).next_sibling = init_family.first_child;
                init_family.first_child = Some(first);
            }
        }
        log::debug!("proc: pid {} orphans adopted by init", p.pid());
        self.wakeup(WaitChannel::of(init));
    }

    /// Exit the current process. Does not return.
    ///
    /// The process stays a zombie until its parent calls `wait`.
    pub fn exit(&self, status: i32) -> ! {
        let m = &self.machine;
        let platform = self.platform();
        let Some(p) = self.myproc() else {
            panic!("exit: no process");
        };
        if self.init.get() == Some(&p.slot()) {
            panic!("init exiting");
        }

        // Close all open files.
        let data = unsafe { &mut *p.data() };
        for file in data.ofile.iter_mut() {
            if let Some(f) = file.take() {
                platform.close_file(f);
            }
        }
        platform.begin_op();
        if let Some(cwd) = data.cwd.take() {
            platform.put_inode(cwd);
        }
        platform.end_op();

        self.wait_lock.acquire(m);

        // Give any children to init.
        self.reparent(p);

        // Parent might be sleeping in wait().
        let parent = unsafe { (*p.family()).parent }.and_then(|s| self.pool.get(m, s));
        if let Some(parent) = parent {
            self.wakeup(WaitChannel::of(parent));
        }

        p.lock.acquire(m);
        p.set_xstate(status);
        p.set_state(ProcState::Zombie);
        log::debug!("proc: pid {} exited with status {}", p.pid(), status);

        self.wait_lock.release(m);

        // Jump into the scheduler, never to return.
        self.sched(p);
        panic!("zombie exit");
    }

    /// Wait for a child to exit and return its pid.
    ///
    /// The exit status is copied to user address `addr` when given. Fails
    /// with `NoChildren` when the caller has no children or has been
    /// killed, and with `BadAddress` (leaving the zombie for a retry) when
    /// the status cannot be copied out.
    pub fn wait(&self, addr: Option<usize>) -> Result<Pid> {
        let m = &self.machine;
        let p = self.myproc().ok_or(Error::NoProcess)?;

        self.wait_lock.acquire(m);
        loop {
            // Scan through the list looking for exited children.
            let mut havekids = false;
            let mut prev: Option<&Proc<P>> = None;
            let mut cur = unsafe { (*p.family()).first_child };
            while let Some(slot) = cur {
                let Some(c) = self.pool.get(m, slot) else {
                    panic!("wait: stale child slot {}", slot.index());
                };
                let next = unsafe { (*c.family()).next_sibling };
                c.lock.acquire(m);
                if unsafe { (*c.family()).parent } == Some(p.slot()) {
                    havekids = true;
                    if c.state() == ProcState::Zombie {
                        let pid = c.pid();
                        if let Some(addr) = addr {
                            let status = c.xstate().to_ne_bytes();
                            if let Err(e) = self.copy_out_user(p, addr, &status) {
                                c.lock.release(m);
                                self.wait_lock.release(m);
                                return Err(e);
                            }
                        }
                        unsafe {
                            match prev {
                                Some(prev) => (*prev.family()).next_sibling = next,
                                None => (*p.family()).first_child = next,
                            }
                            (*c.family()).next_sibling = None;
                        }
                        self.pids.remove(c);
                        self.pool.release(m, c);
                        c.lock.release(m);
                        self.pool.recycle(m, c.slot());
                        self.wait_lock.release(m);
                        log::debug!("proc: pid {} reaped pid {}", p.pid(), pid);
                        return Ok(pid);
                    }
                }
                c.lock.release(m);
                prev = Some(c);
                cur = next;
            }

            // No point waiting if we don't have any children.
            if !havekids || p.is_killed() {
                self.wait_lock.release(m);
                return Err(Error::NoChildren);
            }

            // Wait for a child to exit.
            self.sleep(WaitChannel::of(p), &self.wait_lock);
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Grow or shrink the current process's user memory by `n` bytes
    pub fn grow_memory(&self, n: isize) -> Result<()> {
        let platform = self.platform();
        let p = self.myproc().ok_or(Error::NoProcess)?;
        let data = unsafe { &mut *p.data() };
        let space = data.space.as_mut().ok_or(Error::NoProcess)?;
        let sz = p.size();
        let new = if n > 0 {
            let target = sz.checked_add(n as usize).ok_or(Error::OutOfMemory)?;
            if target > TRAPFRAME {
                return Err(Error::OutOfMemory);
            }
            platform.grow(space, sz, target, PteFlags::W)?
        } else if n < 0 {
            platform.shrink(space, sz, sz.saturating_sub(n.unsigned_abs()))
        } else {
            sz
        };
        p.set_size(new);
        Ok(())
    }

    fn copy_out_user(&self, p: &Proc<P>, va: usize, src: &[u8]) -> Result<()> {
        if !user_range_ok(p.size(), va, src.len()) {
            return Err(Error::BadAddress);
        }
        let data = unsafe { &mut *p.data() };
        let space = data.space.as_mut().ok_or(Error::BadAddress)?;
        self.platform().copy_out(space, va, src)
    }

    fn copy_in_user(&self, p: &Proc<P>, dst: &mut [u8], va: usize) -> Result<()> {
        if !user_range_ok(p.size(), va, dst.len()) {
            return Err(Error::BadAddress);
        }
        let data = unsafe { &*p.data() };
        let space = data.space.as_ref().ok_or(Error::BadAddress)?;
        self.platform().copy_in(space, dst, va)
    }

    /// Copy `src` to a user address of the current process or to a kernel
    /// buffer ("either_copyout")
    pub fn copy_to_process(&self, dst: CopyDst<'_>, src: &[u8]) -> Result<()> {
        match dst {
            CopyDst::User(va) => {
                let p = self.myproc().ok_or(Error::NoProcess)?;
                self.copy_out_user(p, va, src)
            }
            CopyDst::Kernel(buf) => {
                let dst = buf
                    .get_mut(..src.len())
                    .ok_or(Error::InvalidArgument("destination too small"))?;
                dst.copy_from_slice(src);
                Ok(())
            }
        }
    }

    /// Fill `dst` from a user address of the current process or from a
    /// kernel buffer ("either_copyin")
    pub fn copy_from_process(&self, dst: &mut [u8], src: CopySrc<'_>) -> Result<()> {
        match src {
            CopySrc::User(va) => {
                let p = self.myproc().ok_or(Error::NoProcess)?;
                self.copy_in_user(p, dst, va)
            }
            CopySrc::Kernel(buf) => {
                let src = buf
                    .get(..dst.len())
                    .ok_or(Error::InvalidArgument("source too small"))?;
                dst.copy_from_slice(src);
                Ok(())
            }
        }
    }
}

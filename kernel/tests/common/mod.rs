//! Hosted simulation of the machine beneath the process core
//!
//! Every simulated CPU and every process runs on its own OS thread. A CPU is
//! a token (`Hart`) that moves from thread to thread on each context switch;
//! only the thread holding a token runs kernel code, and it sees the token's
//! CPU id and interrupt flag through a thread local. A switch hands the token
//! to the thread owning the target context and parks the caller until some
//! CPU switches back to it, which is cooperative stackful switching.
//!
//! User programs are Rust closures registered with the platform and selected
//! by the trap frame's `epc` when a process returns to user space. Programs
//! must not block on host primitives while they hold a CPU, and must not
//! panic, since a panic cannot unwind out of a process thread.

#![allow(dead_code)]

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, mpsc};
use std::thread;
use std::time::Duration;

use nos_api::memory::page_round_up;
use nos_api::{
    AddressSpaceOps, Arch, Context, ContextEntry, Error, FileOps, HeapAllocator, KernelMemory, PAGE_SIZE,
    PhysAddr, PteFlags, Result, TrapFrame,
};
use nos_proc::{Pid, ProcConfig, ProcTable, SpinLock, WaitChannel};

/// Process table running on the simulation
pub type Kernel = ProcTable<SimPlatform>;

/// User program body
pub type Program = Arc<dyn Fn(&'static Kernel) + Send + Sync>;

/// How long a test waits for a scenario to report back
pub const TIMEOUT: Duration = Duration::from_secs(20);

/// Image handed to `create_first_process`
pub const INITCODE: [u8; 16] = [0x13; 16];

/// User address the tests use for wait status words
pub const STATUS_VA: usize = 256;

// ============================================================================
// CPU tokens
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Hart {
    cpu: usize,
    intr: bool,
}

thread_local! {
    static HART: Cell<Option<Hart>> = const { Cell::new(None) };
}

fn hart() -> Hart {
    match HART.with(|h| h.get()) {
        Some(h) => h,
        None => panic!("no simulated cpu on this thread"),
    }
}

fn set_hart(h: Option<Hart>) {
    HART.with(|c| c.set(h));
}

fn set_intr(on: bool) {
    let mut h = hart();
    h.intr = on;
    set_hart(Some(h));
}

/// Run the calling thread as `cpu`, interrupts off
pub fn attach(cpu: usize) {
    set_hart(Some(Hart { cpu, intr: false }));
}

pub fn detach() {
    set_hart(None);
}

/// Mailbox a context's thread parks on until a CPU is handed to it
#[derive(Default)]
struct Handoff {
    token: Mutex<Option<Hart>>,
    ready: Condvar,
}

impl Handoff {
    fn give(&self, h: Hart) {
        let mut slot = self.token.lock().unwrap();
        assert!(slot.is_none(), "context resumed twice");
        *slot = Some(h);
        self.ready.notify_one();
    }

    fn take(&self) -> Hart {
        let mut slot = self.token.lock().unwrap();
        loop {
            if let Some(h) = slot.take() {
                return h;
            }
            slot = self.ready.wait(slot).unwrap();
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Kernel heap backed by the host allocator, with a failure switch
#[derive(Clone)]
pub struct SimHeap {
    fail: Arc<AtomicBool>,
}

impl HeapAllocator for SimHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.fail.load(Ordering::SeqCst) || layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// User address space: a root page, user pages from address 0 up, and
/// the fixed kernel mappings at the top
pub struct SimSpace {
    root: NonNull<u8>,
    user: Vec<NonNull<u8>>,
    fixed: Vec<(usize, PhysAddr, PteFlags)>,
}

unsafe impl Send for SimSpace {}

impl SimSpace {
    fn pages_for(size: usize) -> usize {
        page_round_up(size) / PAGE_SIZE
    }

    /// Host pointer and run length of the bytes at user address `va`
    fn locate(&self, va: usize, len: usize) -> Result<(*mut u8, usize)> {
        let page = self.user.get(va / PAGE_SIZE).ok_or(Error::BadAddress)?;
        let off = va % PAGE_SIZE;
        let run = len.min(PAGE_SIZE - off);
        Ok((unsafe { page.as_ptr().add(off) }, run))
    }
}

// ============================================================================
// Files
// ============================================================================

#[derive(Debug)]
pub struct FileObj {
    pub name: &'static str,
}

#[derive(Debug)]
pub struct InodeObj;

pub type SimFile = Arc<FileObj>;
pub type SimInode = Arc<InodeObj>;

// ============================================================================
// Platform
// ============================================================================

pub struct SimPlatform {
    pages_out: AtomicUsize,
    page_limit: AtomicUsize,
    heap_fail: Arc<AtomicBool>,
    contexts: Mutex<HashMap<usize, Arc<Handoff>>>,
    programs: Mutex<Vec<Program>>,
    // Address of the leaked process table running on this platform
    kernel: OnceLock<usize>,
    root: SimInode,
    fs_inits: AtomicUsize,
    ops_begun: AtomicUsize,
    ops_ended: AtomicUsize,
    /// Lock that parked processes sleep under
    pub park: SpinLock,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            pages_out: AtomicUsize::new(0),
            page_limit: AtomicUsize::new(usize::MAX),
            heap_fail: Arc::new(AtomicBool::new(false)),
            contexts: Mutex::new(HashMap::new()),
            programs: Mutex::new(Vec::new()),
            kernel: OnceLock::new(),
            root: Arc::new(InodeObj),
            fs_inits: AtomicUsize::new(0),
            ops_begun: AtomicUsize::new(0),
            ops_ended: AtomicUsize::new(0),
            park: SpinLock::new("park"),
        }
    }

    fn kernel(&self) -> &'static Kernel {
        let addr = *self.kernel.get().expect("platform not attached to a process table");
        unsafe { &*(addr as *const Kernel) }
    }

    /// Register a user program; its id is the `epc` that runs it
    pub fn register(&self, program: impl Fn(&'static Kernel) + Send + Sync + 'static) -> usize {
        let mut programs = self.programs.lock().unwrap();
        programs.push(Arc::new(program));
        programs.len() - 1
    }

    /// Pages currently handed out by the page allocator
    pub fn pages_out(&self) -> usize {
        self.pages_out.load(Ordering::SeqCst)
    }

    /// Fail page allocations once `limit` pages are outstanding
    pub fn set_page_limit(&self, limit: usize) {
        self.page_limit.store(limit, Ordering::SeqCst);
    }

    pub fn clear_page_limit(&self) {
        self.set_page_limit(usize::MAX);
    }

    pub fn fail_heap(&self, fail: bool) {
        self.heap_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fs_inits(&self) -> usize {
        self.fs_inits.load(Ordering::SeqCst)
    }

    /// (begun, ended) file-system operations
    pub fn fs_ops(&self) -> (usize, usize) {
        (self.ops_begun.load(Ordering::SeqCst), self.ops_ended.load(Ordering::SeqCst))
    }

    /// References held on the root directory, including the platform's own
    pub fn root_refs(&self) -> usize {
        Arc::strong_count(&self.root)
    }

    fn handoff(&self, ctx: usize) -> Arc<Handoff> {
        Arc::clone(self.contexts.lock().unwrap().entry(ctx).or_default())
    }
}

impl Arch for SimPlatform {
    fn cpu_id(&self) -> usize {
        hart().cpu
    }

    fn intr_get(&self) -> bool {
        hart().intr
    }

    fn intr_on(&self) {
        set_intr(true);
    }

    fn intr_off(&self) {
        set_intr(false);
    }

    fn wait_for_interrupt(&self) {
        thread::sleep(Duration::from_micros(200));
    }

    fn prepare_context(&self, ctx: &mut Context, stack_top: usize, entry: ContextEntry, arg: usize) {
        *ctx = Context::default();
        ctx.ra = entry as usize as u64;
        ctx.sp = stack_top as u64;

        // A reused descriptor gets a fresh thread; the previous occupant's
        // thread stays parked on the old mailbox.
        let key = ctx as *mut Context as usize;
        let handoff = Arc::new(Handoff::default());
        self.contexts.lock().unwrap().insert(key, Arc::clone(&handoff));
        thread::Builder::new()
            .name(format!("ctx-{:#x}", key))
            .spawn(move || {
                set_hart(Some(handoff.take()));
                entry(arg);
            })
            .expect("spawn context thread");
    }

    unsafe fn switch_context(&self, from: *mut Context, to: *const Context) {
        let from = self.handoff(from as usize);
        let to = self.handoff(to as usize);
        let me = hart();
        set_hart(None);
        to.give(me);
        set_hart(Some(from.take()));
    }

    unsafe fn return_to_user(&self, tf: NonNull<TrapFrame>) -> ! {
        set_intr(true);
        let epc = unsafe { tf.as_ref().epc } as usize;
        let program = self.programs.lock().unwrap().get(epc).cloned();
        let kernel = self.kernel();
        if let Some(program) = program {
            program(kernel);
        }
        kernel.exit(0)
    }
}

impl KernelMemory for SimPlatform {
    type Heap = SimHeap;

    fn alloc_page(&self) -> Option<NonNull<u8>> {
        self.pages_out
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.page_limit.load(Ordering::SeqCst)).then_some(n + 1)
            })
            .ok()?;
        let page = NonNull::new(unsafe { alloc::alloc_zeroed(page_layout()) });
        if page.is_none() {
            self.pages_out.fetch_sub(1, Ordering::SeqCst);
        }
        page
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        unsafe { alloc::dealloc(page.as_ptr(), page_layout()) };
        self.pages_out.fetch_sub(1, Ordering::SeqCst);
    }

    fn heap(&self) -> SimHeap {
        SimHeap {
            fail: Arc::clone(&self.heap_fail),
        }
    }
}

impl AddressSpaceOps for SimPlatform {
    type AddressSpace = SimSpace;

    fn create_address_space(&self) -> Option<SimSpace> {
        Some(SimSpace {
            root: self.alloc_page()?,
            user: Vec::new(),
            fixed: Vec::new(),
        })
    }

    fn map_pages(&self, space: &mut SimSpace, va: usize, size: usize, pa: PhysAddr, flags: PteFlags) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("mappages: size"));
        }
        if space.fixed.iter().any(|&(v, _, _)| v == va) {
            return Err(Error::InvalidArgument("mappages: remap"));
        }
        space.fixed.push((va, pa, flags | PteFlags::V));
        Ok(())
    }

    fn unmap_pages(&self, space: &mut SimSpace, va: usize, npages: usize, _free: bool) {
        let end = va + npages * PAGE_SIZE;
        space.fixed.retain(|&(v, _, _)| v < va || v >= end);
    }

    fn destroy_address_space(&self, mut space: SimSpace, size: usize) {
        assert!(space.fixed.is_empty(), "freewalk: leaf");
        assert_eq!(space.user.len(), SimSpace::pages_for(size), "uvmfree: size mismatch");
        for page in space.user.drain(..) {
            unsafe { self.free_page(page) };
        }
        unsafe { self.free_page(space.root) };
    }

    fn trampoline(&self) -> PhysAddr {
        PhysAddr(0x8000_0000)
    }

    fn map_first_segment(&self, space: &mut SimSpace, image: &[u8]) -> Result<()> {
        let page = self.alloc_page().ok_or(Error::OutOfMemory)?;
        unsafe { core::ptr::copy_nonoverlapping(image.as_ptr(), page.as_ptr(), image.len()) };
        space.user.push(page);
        Ok(())
    }

    fn grow(&self, space: &mut SimSpace, old: usize, new: usize, _flags: PteFlags) -> Result<usize> {
        if new < old {
            return Ok(old);
        }
        let keep = SimSpace::pages_for(old);
        while space.user.len() < SimSpace::pages_for(new) {
            match self.alloc_page() {
                Some(page) => space.user.push(page),
                None => {
                    for page in space.user.drain(keep..) {
                        unsafe { self.free_page(page) };
                    }
                    return Err(Error::OutOfMemory);
                }
            }
        }
        Ok(new)
    }

    fn shrink(&self, space: &mut SimSpace, old: usize, new: usize) -> usize {
        if new >= old {
            return old;
        }
        let keep = SimSpace::pages_for(new);
        if space.user.len() > keep {
            for page in space.user.drain(keep..) {
                unsafe { self.free_page(page) };
            }
        }
        new
    }

    fn copy_address_space(&self, src: &SimSpace, dst: &mut SimSpace, size: usize) -> Result<()> {
        let keep = dst.user.len();
        for from in src.user.iter().take(SimSpace::pages_for(size)) {
            let Some(page) = self.alloc_page() else {
                for page in dst.user.drain(keep..) {
                    unsafe { self.free_page(page) };
                }
                return Err(Error::OutOfMemory);
            };
            unsafe { core::ptr::copy_nonoverlapping(from.as_ptr(), page.as_ptr(), PAGE_SIZE) };
            dst.user.push(page);
        }
        Ok(())
    }

    fn copy_out(&self, space: &mut SimSpace, mut va: usize, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let (dst, run) = space.locate(va, src.len())?;
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, run) };
            src = &src[run..];
            va += run;
        }
        Ok(())
    }

    fn copy_in(&self, space: &SimSpace, mut dst: &mut [u8], mut va: usize) -> Result<()> {
        while !dst.is_empty() {
            let (src, run) = space.locate(va, dst.len())?;
            unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), run) };
            dst = &mut dst[run..];
            va += run;
        }
        Ok(())
    }
}

impl FileOps for SimPlatform {
    type File = SimFile;
    type Inode = SimInode;

    fn dup_file(&self, file: &SimFile) -> SimFile {
        Arc::clone(file)
    }

    fn close_file(&self, file: SimFile) {
        drop(file);
    }

    fn dup_inode(&self, inode: &SimInode) -> SimInode {
        Arc::clone(inode)
    }

    fn put_inode(&self, inode: SimInode) {
        drop(inode);
    }

    fn root_inode(&self) -> Option<SimInode> {
        Some(Arc::clone(&self.root))
    }

    fn begin_op(&self) {
        self.ops_begun.fetch_add(1, Ordering::SeqCst);
    }

    fn end_op(&self) {
        self.ops_ended.fetch_add(1, Ordering::SeqCst);
    }

    fn init_fs(&self) {
        self.fs_inits.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Booting and process helpers
// ============================================================================

/// Leak a process table on a fresh platform. No CPU is started.
pub fn new_kernel(config: ProcConfig) -> &'static Kernel {
    let kernel: &'static Kernel = Box::leak(Box::new(
        ProcTable::new(SimPlatform::new(), config).expect("proc table"),
    ));
    kernel
        .platform()
        .kernel
        .set(kernel as *const Kernel as usize)
        .expect("platform attached twice");
    kernel
}

/// Start one scheduler thread per configured CPU
pub fn start_cpus(kernel: &'static Kernel) {
    for cpu in 0..kernel.config().ncpu {
        thread::Builder::new()
            .name(format!("cpu{}", cpu))
            .spawn(move || {
                attach(cpu);
                kernel.scheduler();
            })
            .expect("spawn cpu thread");
    }
}

/// Boot a kernel whose first process runs `init`
pub fn boot(config: ProcConfig, init: impl Fn(&'static Kernel) + Send + Sync + 'static) -> &'static Kernel {
    let kernel = new_kernel(config);
    let id = kernel.platform().register(init);
    assert_eq!(id, 0, "init must be program 0");
    attach(0);
    kernel.create_first_process(&INITCODE).expect("userinit");
    detach();
    start_cpus(kernel);
    kernel
}

/// Boot a kernel, run `scenario` as init and return what it produced.
/// Init parks afterwards; it must never exit.
pub fn run_init<T: Send + 'static>(
    config: ProcConfig,
    scenario: impl Fn(&'static Kernel) -> T + Send + Sync + 'static,
) -> T {
    let (tx, rx) = mpsc::channel();
    boot(config, move |k| {
        let out = scenario(k);
        let _ = tx.send(out);
        park(k)
    });
    rx.recv_timeout(TIMEOUT).expect("init scenario timed out")
}

/// Sleep forever on a channel nobody wakes
pub fn park(k: &'static Kernel) -> ! {
    let lk = &k.platform().park;
    lk.acquire(k.machine());
    loop {
        k.sleep(WaitChannel::from_raw(usize::MAX), lk);
    }
}

/// Fork the current process into a child that runs `program`
pub fn spawn(k: &'static Kernel, program: impl Fn(&'static Kernel) + Send + Sync + 'static) -> Result<Pid> {
    let id = k.platform().register(program);
    fork_into(k, id)
}

/// Fork with the child's trap frame pointing at program `id`
pub fn fork_into(k: &'static Kernel, id: usize) -> Result<Pid> {
    let p = k.myproc().ok_or(Error::NoProcess)?;
    let tf = p.trapframe().ok_or(Error::NoProcess)?.as_ptr();
    let saved = unsafe { (*tf).epc };
    unsafe { (*tf).epc = id as u64 };
    let pid = k.fork();
    unsafe { (*tf).epc = saved };
    pid
}

/// Yield until `pid` reaches `state`, giving up after a bounded number of
/// rounds
pub fn yield_until(k: &'static Kernel, pid: Pid, state: nos_proc::ProcState) -> bool {
    for _ in 0..100_000 {
        if k.proc_info(pid).is_some_and(|row| row.state == state) {
            return true;
        }
        k.yield_cpu();
    }
    false
}

/// Config with `ncpu` CPUs and defaults otherwise
pub fn config(ncpu: usize) -> ProcConfig {
    ProcConfig::default().with_ncpu(ncpu)
}

//! Per-CPU ready queues
//!
//! One FIFO per CPU, linked intrusively through each descriptor's
//! `run_next` field, so enqueueing never allocates. Only `Runnable`
//! descriptors are ever linked, and each at most once.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use nos_api::Platform;

use crate::config::Placement;
use crate::cpu::Machine;
use crate::process::pool::ProcPool;
use crate::process::proc::NO_LINK;
use crate::process::{Proc, Slot};
use crate::sync::IrqMutex;

#[derive(Default)]
struct RunQueue {
    head: Option<Slot>,
    tail: Option<Slot>,
}

pub struct ReadyQueues {
    queues: Box<[IrqMutex<RunQueue>]>,
    // Queue lengths, readable without the queue lock for placement
    lens: Box<[AtomicUsize]>,
    placement: Placement,
}

impl ReadyQueues {
    pub fn new(ncpu: usize, placement: Placement) -> Self {
        let queues: Vec<IrqMutex<RunQueue>> =
            (0..ncpu).map(|_| IrqMutex::new(RunQueue::default())).collect();
        let lens: Vec<AtomicUsize> = (0..ncpu).map(|_| AtomicUsize::new(0)).collect();
        Self {
            queues: queues.into_boxed_slice(),
            lens: lens.into_boxed_slice(),
            placement,
        }
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Number of processes waiting on `cpu`'s queue
    pub fn len(&self, cpu: usize) -> usize {
        self.lens.get(cpu).map_or(0, |l| l.load(Ordering::Acquire))
    }

    /// Queue a process becoming runnable is placed on.
    /// Interrupts must be off.
    pub fn target<P: Platform>(&self, m: &Machine<P>) -> usize {
        let local = m.cpu_id();
        match self.placement {
            Placement::LocalCpu => local,
            Placement::LeastLoaded => {
                let mut best = local;
                let mut best_len = self.len(local);
                for cpu in 0..self.lens.len() {
                    let len = self.len(cpu);
                    if len < best_len {
                        best = cpu;
                        best_len = len;
                    }
                }
                best
            }
        }
    }

    /// Append `p` to the queue picked by the placement policy and return
    /// that queue's CPU. Caller holds `p.lock` and has set it `Runnable`.
    pub fn enqueue<P: Platform>(&self, m: &Machine<P>, pool: &ProcPool<P>, p: &Proc<P>) -> usize {
        let cpu = self.target(m);
        self.enqueue_on(m, pool, cpu, p);
        cpu
    }

    pub fn enqueue_on<P: Platform>(&self, m: &Machine<P>, pool: &ProcPool<P>, cpu: usize, p: &Proc<P>) {
        let mut q = self.queues[cpu].lock(m);
        p.set_run_next(NO_LINK);
        match q.tail {
            Some(tail) => match pool.get(m, tail) {
                Some(t) => t.set_run_next(p.slot().index()),
                None => panic!("enqueue: stale tail {}", tail.index()),
            },
            None => q.head = Some(p.slot()),
        }
        q.tail = Some(p.slot());
        self.lens[cpu].fetch_add(1, Ordering::AcqRel);
        log::trace!("runq: pid {} -> cpu {}", p.pid(), cpu);
    }

    /// Pop the head of `cpu`'s queue
    pub fn dequeue<'a, P: Platform>(
        &'a self,
        m: &'a Machine<P>,
        pool: &'a ProcPool<P>,
        cpu: usize,
    ) -> Option<&'a Proc<P>> {
        let mut q = self.queues[cpu].lock(m);
        let head = q.head?;
        let Some(p) = pool.get(m, head) else {
            panic!("dequeue: stale head {}", head.index());
        };
        match p.run_next() {
            NO_LINK => {
                q.head = None;
                q.tail = None;
            }
            next => q.head = Some(Slot(next)),
        }
        p.set_run_next(NO_LINK);
        self.lens[cpu].fetch_sub(1, Ordering::AcqRel);
        log::trace!("runq: cpu {} <- pid {}", cpu, p.pid());
        Some(p)
    }
}

//! Process management types

use static_assertions::const_assert;

use crate::memory::PAGE_SIZE;

/// Process identifier. Pid 0 never names a live process.
pub type Pid = usize;

/// Per-process data for the trap handling code.
///
/// Sits in a page of its own just under the trampoline page in the user
/// page table, and is not mapped in the kernel page table. The trampoline
/// saves user registers here on trap entry, then loads the kernel fields
/// and jumps to the kernel trap handler.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    /// Kernel page table
    pub kernel_satp: u64,
    /// Top of process's kernel stack
    pub kernel_sp: u64,
    /// Kernel trap handler
    pub kernel_trap: u64,
    /// Saved user program counter
    pub epc: u64,
    /// Saved kernel tp
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

const_assert!(core::mem::size_of::<TrapFrame>() <= PAGE_SIZE);

/// Callee-saved registers for kernel context switches
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

/// First function a freshly prepared kernel context runs.
/// Receives the argument given to `Arch::prepare_context`.
pub type ContextEntry = extern "C" fn(usize) -> !;

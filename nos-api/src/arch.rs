//! Architecture interface
//!
//! CPU identity, interrupt enable control and the register-level context
//! switch. Everything here is implemented in assembly or CSR accesses on
//! real hardware.

use core::ptr::NonNull;

use crate::process::{Context, ContextEntry, TrapFrame};

/// Per-hart primitives the scheduler is built on
pub trait Arch {
    /// Id of the executing CPU. Only stable while interrupts are off.
    fn cpu_id(&self) -> usize;

    /// Are device interrupts enabled?
    fn intr_get(&self) -> bool;

    /// Enable device interrupts
    fn intr_on(&self);

    /// Disable device interrupts
    fn intr_off(&self);

    /// Idle until an interrupt arrives
    fn wait_for_interrupt(&self);

    /// Set up `ctx` so that the first switch into it runs `entry(arg)` on
    /// the stack whose top is `stack_top`
    fn prepare_context(&self, ctx: &mut Context, stack_top: usize, entry: ContextEntry, arg: usize);

    /// Save callee-saved registers in `from` and resume `to`.
    /// Returns when something later switches back to `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts, and `to` must have been
    /// saved by a previous switch or set up by `prepare_context`.
    unsafe fn switch_context(&self, from: *mut Context, to: *const Context);

    /// Return to user space with the registers saved in `tf`
    ///
    /// # Safety
    ///
    /// `tf` must point at the current process's trap frame page.
    unsafe fn return_to_user(&self, tf: NonNull<TrapFrame>) -> !;
}

//! Platform boundary for kcore
//!
//! Everything the scheduler needs from the machine goes through the
//! [`Platform`] trait: building the initial register frame of a task,
//! saving and restoring register state around a context switch, entering
//! the fault handler and waiting for the next interrupt. The scheduler
//! logic itself is platform independent; [`hosted`] implements the trait
//! on a regular host process so it can be exercised by tests.

pub mod hosted;

use crate::kern::copyio::CpuFault;
use crate::kern::thread::TaskContext;
use crate::types::TaskId;

/// Machine-dependent operations used by the scheduler
pub trait Platform {
    /// Prepare the register frame of a new task so that the first switch
    /// to it enters `entry(arg)` on the stack ending at `stack_top`
    fn init_context(&mut self, ctx: &mut TaskContext, entry: usize, arg: usize, stack_top: usize);

    /// Store the registers of `tid`, which is being switched away from
    fn save_context(&mut self, tid: TaskId, ctx: &mut TaskContext);

    /// Load the registers of `tid`, which becomes the running task
    fn restore_context(&mut self, tid: TaskId, ctx: &TaskContext);

    /// A CPU fault hit `tid`. `resumable` tells whether it will resume
    /// after its fault-resumable call or is about to bring the kernel down.
    fn enter_fault_handler(&mut self, tid: TaskId, fault: CpuFault, resumable: bool);

    /// Halt until the next interrupt
    fn idle(&mut self) {}
}

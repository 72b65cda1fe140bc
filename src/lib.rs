//! kcore - the core of a small single-core kernel
//!
//! This crate provides the two subsystems every other part of a kernel
//! leans on:
//!
//! - memory: a buddy-style block allocator over power-of-two heaps
//!   ([`kern::heap`]) and the heap directory behind `kmalloc`/`kfree`
//!   ([`kern::kalloc`]);
//! - execution: tasks and processes ([`kern::thread`], [`kern::task`]), the
//!   preemptive scheduler ([`scheduler`]), wait queues and timers
//!   ([`kern::sched_prim`], [`kern::timer`]), blocking synchronization
//!   ([`kern::lock`]), deferred work ([`kern::tasklet`]) and
//!   fault-resumable calls ([`kern::copyio`]).
//!
//! All scheduler state lives in a [`Kernel`] value. The machine is reached
//! through [`arch::Platform`]; [`arch::hosted`] runs the whole thing in a
//! host process.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel code often needs explicit casts for memory-mapped I/O
#![allow(clippy::unnecessary_cast)]
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

pub mod arch;
pub mod console;
pub mod kern;
pub mod scheduler;

pub use config::KernelConfig;
pub use error::{KResult, KernelError};
pub use kern::sched_prim::{Outcome, WaitObj, WaitResult};
pub use scheduler::Kernel;
pub use types::{HeapId, ObjId, Pid, TaskId, Ticks, PAGE_SIZE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "kcore";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "kcore");
        assert!(!VERSION.is_empty());
    }
}

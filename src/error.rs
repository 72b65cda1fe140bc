//! Kernel error type
//!
//! Recoverable failures only. Contract violations (double free, unlock of a
//! mutex the caller does not own, corrupted wait queues) are assertions and
//! halt the kernel instead of being reported here.

use thiserror::Error;

/// Errors returned by fallible kernel operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A heap or kernel configuration violates a structural constraint
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// No heap could satisfy the request
    #[error("out of memory")]
    OutOfMemory,

    /// The heap directory has no free slot
    #[error("heap directory full")]
    TooManyHeaps,

    /// A heap cannot be destroyed while it still has live allocations
    #[error("heap {id} still has {allocated} bytes allocated")]
    HeapBusy { id: u32, allocated: usize },

    /// The heap id is not registered in the directory
    #[error("no such heap {0}")]
    NoSuchHeap(u32),

    /// A new heap would overlap an existing one
    #[error("heap range overlaps an existing heap")]
    HeapOverlap,

    /// The task table is full
    #[error("task table full")]
    TooManyTasks,

    /// No task with the given id exists
    #[error("no such task {0}")]
    NoSuchTask(u32),

    /// A task tried to join itself
    #[error("task {0} cannot join itself")]
    JoinSelf(u32),

    /// The operation is not allowed for the calling task
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// Every tasklet runner slot is taken
    #[error("tasklet runner table full")]
    TooManyRunners,

    /// Signaling the semaphore would exceed its maximum value
    #[error("semaphore counter overflow")]
    SemOverflow,
}

/// Result alias used across the crate
pub type KResult<T> = core::result::Result<T, KernelError>;

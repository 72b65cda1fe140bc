//! Common types used across kcore
//!
//! Identifiers are plain integers wrapped in newtypes. Objects that own
//! other kernel objects (the task arena, the sync object table, the heap
//! directory) hand out these ids instead of references; every lookup
//! revalidates the id.

use core::fmt;

/// Timer ticks since boot
pub type Ticks = u64;

/// Size of a page, the unit of backing-memory mapping
pub const PAGE_SIZE: usize = 4096;

/// Task (thread) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u32);

/// Process identifier. A user process' pid equals the id of its main task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

/// Synchronization object identifier (mutex, condvar, semaphore, rwlock, join queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjId(pub u32);

/// Heap identifier inside a heap directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HeapId(pub u32);

impl TaskId {
    /// The idle task always has id 0
    pub const IDLE: TaskId = TaskId(0);
}

impl Pid {
    /// The kernel process owning every kernel thread
    pub const KERNEL: Pid = Pid(0);
}

impl From<Pid> for TaskId {
    fn from(pid: Pid) -> Self {
        TaskId(pid.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj {}", self.0)
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap {}", self.0)
    }
}

/// Round `n` up to the next power of two, never below `min`. `None` when
/// the result does not fit in a `usize`.
#[inline]
pub fn round_up_pow2(n: usize, min: usize) -> Option<usize> {
    n.max(min).checked_next_power_of_two()
}

//! Kern subsystem - core kernel primitives
//!
//! Heaps and the kmalloc directory, tasks and processes, wait queues,
//! timers, synchronization objects, tasklets and fault-resumable calls.
//! The scheduler entry points are methods on [`Kernel`](crate::Kernel),
//! spread over the modules below by concern.

pub mod copyio;
pub mod heap;
pub mod kalloc;
pub mod lock;
pub mod queue;
pub mod sched_prim;
pub mod task;
pub mod tasklet;
pub mod thread;
pub mod timer;

pub use copyio::{CopyError, CopyResult, CpuFault, FaultMask, UserMemory};
pub use heap::{create_heap, AllocFlags, FreeFlags, Heap, HeapConfig, Mappable};
pub use kalloc::{HeapDirectory, HeapProvider, HeapRegion};
pub use lock::{KCond, KMutex, KSem, MutexFlags, RwLockWp};
pub use task::Process;
pub use tasklet::{Runnable, SafeRingBuf, TaskletFn};
pub use thread::{KthreadFn, Task, TaskClass, TaskContext, TaskState};

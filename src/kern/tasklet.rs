//! Tasklets - deferred work out of interrupt context
//!
//! Interrupt handlers push short jobs into the bounded queue of a tasklet
//! runner, a dedicated kernel thread that drains its queue in FIFO order
//! and sleeps while it is empty. The enqueue that finds the queue empty
//! wakes the runner. Several runners may exist; when more than one has
//! work, the scheduler runs the one with the lowest priority number.
//!
//! A tasklet runs on the runner's kernel thread and gets the kernel, so it
//! may allocate or block. A tasklet that blocks is kept as the runner's
//! job in progress and is called again once the runner is woken; it tells
//! a resumed call from a fresh one with [`Kernel::take_wait_result`].
//!
//! The queue is a [`SafeRingBuf`]: its read position, write position and
//! full flag are packed into one atomic word, so a push interrupted by a
//! nested push on the same CPU, or racing with the consumer, stays
//! consistent.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{MAX_TASKLET_RUNNERS, TASKLET_QUEUE_MAX};
use crate::error::{KResult, KernelError};
use crate::kern::sched_prim::{WaitObj, WaitResult};
use crate::kern::thread::TaskState;
use crate::scheduler::Kernel;
use crate::types::TaskId;

// ============================================================================
// Safe ring buffer
// ============================================================================

const POS_MASK: u32 = (1 << 15) - 1;
const WRITE_SHIFT: u32 = 15;
const FULL_BIT: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingStat {
    read: u16,
    write: u16,
    full: bool,
}

impl RingStat {
    fn unpack(raw: u32) -> Self {
        Self {
            read: (raw & POS_MASK) as u16,
            write: ((raw >> WRITE_SHIFT) & POS_MASK) as u16,
            full: raw & FULL_BIT != 0,
        }
    }

    fn pack(self) -> u32 {
        let mut raw = u32::from(self.read) | (u32::from(self.write) << WRITE_SHIFT);
        if self.full {
            raw |= FULL_BIT;
        }
        raw
    }

    fn is_empty(self) -> bool {
        self.read == self.write && !self.full
    }
}

/// Bounded lock-free FIFO of `Copy` elements.
///
/// One consumer; producers may interrupt each other and the consumer but
/// must not run in parallel on different CPUs.
pub struct SafeRingBuf<T: Copy> {
    state: AtomicU32,
    capacity: u16,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only while unpublished and read only by the
// single consumer while published; the state word orders both.
unsafe impl<T: Copy + Send> Sync for SafeRingBuf<T> {}

impl<T: Copy> SafeRingBuf<T> {
    /// Ring buffer of `capacity` elements, at most 32768
    pub fn new(capacity: u16) -> KResult<Self> {
        if capacity == 0 || capacity > TASKLET_QUEUE_MAX {
            return Err(KernelError::InvalidConfig("ring buffer capacity out of range"));
        }
        let slots: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Ok(Self {
            state: AtomicU32::new(0),
            capacity,
            slots: slots.into_boxed_slice(),
        })
    }

    fn stat(&self) -> RingStat {
        RingStat::unpack(self.state.load(Ordering::Acquire))
    }

    /// Append `elem`. Returns `None` if the buffer is full, otherwise
    /// whether it was empty before the push.
    pub fn push(&self, elem: T) -> Option<bool> {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let cs = RingStat::unpack(raw);
            if cs.full {
                return None;
            }

            // SAFETY: the slot at the write position is not published yet,
            // the consumer cannot be reading it
            unsafe { (*self.slots[usize::from(cs.write)].get()).write(elem) };

            let mut ns = cs;
            ns.write = (cs.write + 1) % self.capacity;
            ns.full = ns.write == ns.read;

            match self
                .state
                .compare_exchange_weak(raw, ns.pack(), Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Some(cs.is_empty()),
                Err(actual) => raw = actual,
            }
        }
    }

    /// Remove the oldest element
    pub fn pop(&self) -> Option<T> {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let cs = RingStat::unpack(raw);
            if cs.is_empty() {
                return None;
            }

            // SAFETY: the slot at the read position was published by a push
            // and producers do not touch it until the read position moves
            let elem = unsafe { (*self.slots[usize::from(cs.read)].get()).assume_init_read() };

            let ns = RingStat {
                read: (cs.read + 1) % self.capacity,
                write: cs.write,
                full: false,
            };

            match self
                .state
                .compare_exchange_weak(raw, ns.pack(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(elem),
                Err(actual) => raw = actual,
            }
        }
    }

    pub fn len(&self) -> usize {
        let s = self.stat();
        if s.full {
            usize::from(self.capacity)
        } else {
            (usize::from(s.write) + usize::from(self.capacity) - usize::from(s.read)) % usize::from(self.capacity)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stat().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.stat().full
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.capacity)
    }
}

impl<T: Copy> core::fmt::Debug for SafeRingBuf<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = self.stat();
        f.debug_struct("SafeRingBuf")
            .field("capacity", &self.capacity)
            .field("read", &s.read)
            .field("write", &s.write)
            .field("full", &s.full)
            .finish()
    }
}

// ============================================================================
// Tasklets
// ============================================================================

/// Deferred work payload
pub trait Runnable {
    fn run(self, k: &mut Kernel);
}

/// A tasklet: a function and up to two arguments
#[derive(Clone, Copy)]
pub enum TaskletFn {
    Nullary(fn(&mut Kernel)),
    Unary(fn(&mut Kernel, usize), usize),
    Binary(fn(&mut Kernel, usize, usize), usize, usize),
}

impl Runnable for TaskletFn {
    fn run(self, k: &mut Kernel) {
        match self {
            TaskletFn::Nullary(f) => f(k),
            TaskletFn::Unary(f, a) => f(k, a),
            TaskletFn::Binary(f, a, b) => f(k, a, b),
        }
    }
}

impl core::fmt::Debug for TaskletFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            TaskletFn::Nullary(_) => f.write_str("Nullary"),
            TaskletFn::Unary(_, a) => f.debug_tuple("Unary").field(&a).finish(),
            TaskletFn::Binary(_, a, b) => f.debug_tuple("Binary").field(&a).field(&b).finish(),
        }
    }
}

/// A runner thread and its queue
#[derive(Debug)]
pub struct TaskletRunner {
    pub(crate) id: usize,
    pub(crate) priority: u32,
    pub(crate) task: TaskId,
    pub(crate) queue: SafeRingBuf<TaskletFn>,
    /// Tasklet that blocked and has not finished yet
    pub(crate) in_progress: Option<TaskletFn>,
    /// Set while the runner sleeps on an empty queue
    pub(crate) waiting_for_jobs: AtomicBool,
    pub(crate) jobs_run: u64,
}

impl TaskletRunner {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a tasklet of this runner is blocked mid-run
    pub fn is_busy(&self) -> bool {
        self.in_progress.is_some()
    }

    pub(crate) fn has_work(&self) -> bool {
        self.in_progress.is_some() || !self.queue.is_empty()
    }

    pub fn jobs_run(&self) -> u64 {
        self.jobs_run
    }
}

/// Runners ordered by priority, creation order among equals
#[derive(Debug, Default)]
pub struct TaskletRunners {
    runners: heapless::Vec<TaskletRunner, MAX_TASKLET_RUNNERS>,
}

impl TaskletRunners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskletRunner> {
        self.runners.iter()
    }

    pub fn get(&self, id: usize) -> Option<&TaskletRunner> {
        self.runners.iter().find(|r| r.id == id)
    }

    fn by_task_mut(&mut self, task: TaskId) -> Option<&mut TaskletRunner> {
        self.runners.iter_mut().find(|r| r.task == task)
    }

    fn insert(&mut self, runner: TaskletRunner) -> KResult<()> {
        let pos = self
            .runners
            .iter()
            .position(|r| r.priority > runner.priority)
            .unwrap_or(self.runners.len());
        self.runners
            .insert(pos, runner)
            .map_err(|_| KernelError::TooManyRunners)
    }
}

impl Kernel {
    /// Start a runner thread with a queue of `queue_size` tasklets.
    /// Returns the runner id used to enqueue work.
    pub fn create_tasklet_runner(&mut self, priority: u32, queue_size: u16) -> KResult<usize> {
        if self.tasklets.len() >= MAX_TASKLET_RUNNERS {
            return Err(KernelError::TooManyRunners);
        }
        let queue = SafeRingBuf::new(queue_size)?;
        let id = self.tasklets.len();

        let tid = self.kthread_create(tasklet_runner_main, id, "tasklet")?;
        // parked until the first job arrives
        self.change_state(tid, TaskState::Sleeping);

        self.tasklets.insert(TaskletRunner {
            id,
            priority,
            task: tid,
            queue,
            in_progress: None,
            waiting_for_jobs: AtomicBool::new(true),
            jobs_run: 0,
        })?;

        log::debug!("tasklet: runner {} ({}) priority {} queue {}", id, tid, priority, queue_size);
        Ok(id)
    }

    /// Queue `tasklet` on `runner`. Returns false if the queue is full or
    /// the runner does not exist.
    pub fn enqueue_tasklet(&mut self, runner: usize, tasklet: TaskletFn) -> bool {
        let Some(r) = self.tasklets.get(runner) else {
            log::warn!("tasklet: no runner {}", runner);
            return false;
        };
        let Some(was_empty) = r.queue.push(tasklet) else {
            log::warn!("tasklet: runner {} queue is full", runner);
            return false;
        };

        if was_empty && r.waiting_for_jobs.swap(false, Ordering::AcqRel) {
            let tid = r.task;
            self.disable_preemption();
            self.wake_task(tid, WaitResult::Awakened);
            self.enable_preemption_nosched();
        }
        true
    }

    pub fn enqueue_tasklet0(&mut self, runner: usize, f: fn(&mut Kernel)) -> bool {
        self.enqueue_tasklet(runner, TaskletFn::Nullary(f))
    }

    pub fn enqueue_tasklet1(&mut self, runner: usize, f: fn(&mut Kernel, usize), arg1: usize) -> bool {
        self.enqueue_tasklet(runner, TaskletFn::Unary(f, arg1))
    }

    pub fn enqueue_tasklet2(
        &mut self,
        runner: usize,
        f: fn(&mut Kernel, usize, usize),
        arg1: usize,
        arg2: usize,
    ) -> bool {
        self.enqueue_tasklet(runner, TaskletFn::Binary(f, arg1, arg2))
    }

    /// Body of a runner thread: finish the tasklet in progress, run every
    /// queued one, then sleep until the next enqueue. Returns the number of
    /// tasklets completed.
    ///
    /// If a tasklet blocks, the runner returns at once and the tasklet is
    /// called again, wait result pending, when the runner next runs.
    pub fn run_tasklets(&mut self) -> usize {
        let tid = self.current;
        let mut count = 0;

        let mut resumed = match self.tasklets.by_task_mut(tid) {
            Some(r) => r.in_progress.take(),
            None => panic!("run_tasklets: {} is not a tasklet runner", tid),
        };

        loop {
            let job = match resumed.take() {
                Some(job) => job,
                None => {
                    let Some(job) = self.tasklets.by_task_mut(tid).and_then(|r| r.queue.pop()) else {
                        break;
                    };
                    // a fresh tasklet must not see the runner's own wakeup
                    let _ = self.take_wait_result();
                    job
                }
            };

            job.run(self);
            if self.current != tid {
                if let Some(r) = self.tasklets.by_task_mut(tid) {
                    r.in_progress = Some(job);
                    r.jobs_run += count as u64;
                }
                log::trace!("tasklet: {} blocked in {:?}", tid, job);
                return count;
            }
            count += 1;
        }

        self.disable_preemption();
        if let Some(r) = self.tasklets.by_task_mut(tid) {
            r.jobs_run += count as u64;
            r.waiting_for_jobs.store(true, Ordering::Release);
        }
        let _ = self.sleep_on(WaitObj::None, 0);
        count
    }

    pub fn tasklet_runner(&self, runner: usize) -> Option<&TaskletRunner> {
        self.tasklets.get(runner)
    }

    pub fn tasklet_runner_count(&self) -> usize {
        self.tasklets.len()
    }

    pub fn pending_tasklets(&self, runner: usize) -> usize {
        self.tasklets.get(runner).map_or(0, |r| r.pending())
    }
}

fn tasklet_runner_main(k: &mut Kernel, _runner: usize) {
    k.run_tasklets();
}

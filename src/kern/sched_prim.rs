//! Scheduling Primitives - Wait/Wakeup
//!
//! A blocking operation records what the task waits for in its wait
//! object, links the task into the wait queue of that object and puts it
//! to sleep. Wakers dequeue tasks from the head of the queue, so every
//! wait queue is FIFO. A task may additionally arm a wakeup timer; the
//! timer and the wait queue race, whichever comes first wakes the task
//! and the other is cancelled.

use crate::kern::thread::TaskState;
use crate::scheduler::Kernel;
use crate::types::{ObjId, TaskId, Ticks};

// ============================================================================
// Wait Objects
// ============================================================================

/// What a sleeping task waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitObj {
    /// Not blocked on anything (or parked without an object)
    #[default]
    None,
    Mutex(ObjId),
    /// Waiting on `cond`, `mutex` is re-acquired on wakeup
    Condvar { cond: ObjId, mutex: ObjId },
    Semaphore(ObjId),
    RwLock { lock: ObjId, exclusive: bool },
    /// Joining a task
    Task(TaskId),
    /// Timed delay
    Timer,
}

/// Why a task was woken up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The object was signalled or released
    Awakened,
    /// The wakeup timer fired first
    TimedOut,
    /// The joined task exited with this code
    Joined(i32),
}

impl WaitResult {
    pub fn is_timeout(self) -> bool {
        self == WaitResult::TimedOut
    }
}

/// Result of an operation that may block the calling task
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Completed without sleeping
    Done(T),
    /// The caller is now sleeping; the CPU went to another task
    Blocked,
}

impl<T> Outcome<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Blocked)
    }

    pub fn is_done(&self) -> bool {
        !self.is_blocked()
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Blocked => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Done(v) => Outcome::Done(f(v)),
            Outcome::Blocked => Outcome::Blocked,
        }
    }
}

// ============================================================================
// Sleep / Wakeup
// ============================================================================

impl Kernel {
    /// Wait queue object a task waiting on `wobj` is linked into
    pub(crate) fn wait_queue_of(&self, wobj: WaitObj) -> Option<ObjId> {
        match wobj {
            WaitObj::None | WaitObj::Timer => None,
            WaitObj::Mutex(id) | WaitObj::Semaphore(id) => Some(id),
            WaitObj::Condvar { cond, .. } => Some(cond),
            WaitObj::RwLock { lock, exclusive: true } => Some(lock),
            WaitObj::RwLock { lock, exclusive: false } => Some(self.sync.rwlock_readers_queue(lock)),
            WaitObj::Task(tid) => Some(self.tasks.expect(tid).join_obj),
        }
    }

    /// Put the current task to sleep on `wobj` and switch away.
    ///
    /// Must be entered with preemption disabled exactly once; it is
    /// re-enabled before switching. A non-zero `timeout` arms a wakeup
    /// timer. Returns `Done` only if the task is running again when the
    /// switch returns.
    pub(crate) fn sleep_on(&mut self, wobj: WaitObj, timeout: Ticks) -> Outcome<WaitResult> {
        let tid = self.current;
        assert!(tid != TaskId::IDLE, "sleep_on: the idle task cannot sleep");
        assert_eq!(
            self.preempt_count(),
            1,
            "sleep_on: {} would sleep with preemption disabled",
            tid
        );

        {
            let task = self.tasks.expect_mut(tid);
            task.wait_obj = wobj;
            task.wait_result = None;
        }
        if let Some(queue) = self.wait_queue_of(wobj) {
            self.sync.waiters_mut(queue).enqueue_tail(&mut self.tasks, tid);
        }
        if timeout > 0 {
            let key = self.timers.schedule(self.ticks().saturating_add(timeout), tid);
            self.tasks.expect_mut(tid).wakeup_timer = Some(key);
        }

        self.change_state(tid, TaskState::Sleeping);
        self.enable_preemption_nosched();
        self.do_schedule();

        if self.current == tid {
            let res = self.tasks.expect_mut(tid).wait_result.take();
            Outcome::Done(res.unwrap_or(WaitResult::Awakened))
        } else {
            Outcome::Blocked
        }
    }

    /// Make a sleeping task runnable. The caller has already removed it
    /// from its wait queue.
    ///
    /// A result recorded earlier (a condvar waiter moved to the mutex
    /// queue) is kept.
    pub(crate) fn wake_task(&mut self, tid: TaskId, result: WaitResult) {
        let task = self.tasks.expect_mut(tid);
        assert_eq!(task.state, TaskState::Sleeping, "wake: {} is not sleeping", tid);
        assert!(!task.wait_chain.is_linked(), "wake: {} is still on a wait queue", tid);

        task.wait_obj = WaitObj::None;
        task.wait_result.get_or_insert(result);
        if let Some(key) = task.wakeup_timer.take() {
            self.timers.cancel(key);
        }
        self.change_state(tid, TaskState::Runnable);
    }

    /// Undo everything `sleep_on` set up, without waking the task
    pub(crate) fn detach_from_wait(&mut self, tid: TaskId) {
        let task = self.tasks.expect_mut(tid);
        let wobj = task.wait_obj;
        let linked = task.wait_chain.is_linked();
        task.wait_obj = WaitObj::None;
        if let Some(key) = task.wakeup_timer.take() {
            self.timers.cancel(key);
        }

        if linked {
            if let Some(queue) = self.wait_queue_of(wobj) {
                self.sync.waiters_mut(queue).remove(&mut self.tasks, tid);
            }
        }

        match wobj {
            // the waiter had already taken its unit
            WaitObj::Semaphore(sem) => self.sync.sem_mut(sem).0.counter += 1,
            WaitObj::RwLock { lock, exclusive: true } => self.rwlock_release_waiters(lock),
            _ => {}
        }
    }

    pub(crate) fn on_wakeup_timer(&mut self, tid: TaskId) {
        let Some(task) = self.tasks.get_mut(tid) else {
            return;
        };
        task.wakeup_timer = None;
        if task.state != TaskState::Sleeping {
            return;
        }

        let wobj = task.wait_obj;
        match wobj {
            WaitObj::Condvar { cond, mutex } => {
                self.sync.waiters_mut(cond).remove(&mut self.tasks, tid);
                self.mutex_reacquire(tid, mutex, WaitResult::TimedOut);
            }
            _ => {
                self.detach_from_wait(tid);
                self.wake_task(tid, WaitResult::TimedOut);
            }
        }
    }

    /// Sleep for `ticks` timer ticks. Zero ticks just yields the CPU.
    pub fn kernel_sleep(&mut self, ticks: Ticks) -> Outcome<()> {
        if ticks == 0 {
            self.schedule();
            return Outcome::Done(());
        }
        self.disable_preemption();
        self.sleep_on(WaitObj::Timer, ticks).map(|_| ())
    }
}

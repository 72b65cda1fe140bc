//! Thread Management
//!
//! A task is one schedulable thread of execution, kernel or user. Tasks
//! live in the [`TaskTable`] arena and are named everywhere else by
//! [`TaskId`]. Each task embeds two queue chains: one for the scheduler
//! lists (runnable, sleeping, zombie) and one for the wait queue of the
//! synchronization object it sleeps on.
//!
//! Lifecycle: RUNNABLE <-> RUNNING -> SLEEPING -> RUNNABLE, and any live
//! state -> ZOMBIE on exit. A zombie keeps its exit code until it is
//! joined, then it is reaped: its kernel stack goes back to the heap and
//! its id becomes free.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::config::MAX_TID;
use crate::error::{KResult, KernelError};
use crate::kern::copyio::FaultMask;
use crate::kern::lock::SyncState;
use crate::kern::queue::{ChainKind, QueueArena, QueueChain};
use crate::kern::sched_prim::{Outcome, WaitObj, WaitResult};
use crate::kern::timer::{TaskTicks, TimerKey};
use crate::scheduler::Kernel;
use crate::types::{ObjId, Pid, TaskId};

/// Body of a kernel thread
pub type KthreadFn = fn(&mut Kernel, usize);

// ============================================================================
// Task State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// Kernel threads never leave kernel mode; user tasks belong to a user
/// process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Kernel,
    User,
}

/// Saved register state, filled in by the platform
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskContext {
    /// Instruction pointer
    pub ip: usize,
    /// Kernel stack pointer
    pub sp: usize,
    /// User stack pointer (user tasks only)
    pub user_sp: usize,
    /// Argument passed to the entry point
    pub arg: usize,
    /// Return value register
    pub retval: usize,
}

/// Kernel stack allocated from the kernel heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: usize,
    pub size: usize,
}

impl KernelStack {
    pub fn top(&self) -> usize {
        self.base + self.size
    }
}

// ============================================================================
// Task
// ============================================================================

/// A schedulable thread
#[derive(Debug)]
pub struct Task {
    pub(crate) tid: TaskId,
    pub(crate) pid: Pid,
    pub(crate) name: heapless::String<32>,
    pub(crate) class: TaskClass,
    pub(crate) state: TaskState,
    pub(crate) context: TaskContext,
    pub(crate) kernel_stack: Option<KernelStack>,
    pub(crate) entry: Option<KthreadFn>,
    pub(crate) ticks: TaskTicks,

    /// What the task sleeps on
    pub(crate) wait_obj: WaitObj,
    /// Why the task was last woken up
    pub(crate) wait_result: Option<WaitResult>,
    pub(crate) wakeup_timer: Option<TimerKey>,

    /// Faults that return to the active fault-resumable call
    pub(crate) fault_resume_mask: FaultMask,

    pub(crate) exit_code: Option<i32>,
    /// Queue object joiners sleep on
    pub(crate) join_obj: ObjId,
    pub(crate) reap_when_off_cpu: bool,

    pub(crate) sched_chain: QueueChain,
    pub(crate) wait_chain: QueueChain,
}

impl Task {
    pub(crate) fn new(tid: TaskId, pid: Pid, class: TaskClass, name: &str, join_obj: ObjId) -> Self {
        let mut short = heapless::String::new();
        for c in name.chars() {
            if short.push(c).is_err() {
                break;
            }
        }

        Self {
            tid,
            pid,
            name: short,
            class,
            state: TaskState::Runnable,
            context: TaskContext::default(),
            kernel_stack: None,
            entry: None,
            ticks: TaskTicks::new(),
            wait_obj: WaitObj::None,
            wait_result: None,
            wakeup_timer: None,
            fault_resume_mask: FaultMask::empty(),
            exit_code: None,
            join_obj,
            reap_when_off_cpu: false,
            sched_chain: QueueChain::new(),
            wait_chain: QueueChain::new(),
        }
    }

    pub fn tid(&self) -> TaskId {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> TaskClass {
        self.class
    }

    pub fn is_user(&self) -> bool {
        self.class == TaskClass::User
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack
    }

    pub fn ticks(&self) -> TaskTicks {
        self.ticks
    }

    pub fn wait_obj(&self) -> WaitObj {
        self.wait_obj
    }

    pub fn fault_resume_mask(&self) -> FaultMask {
        self.fault_resume_mask
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

// ============================================================================
// Task Table
// ============================================================================

/// Arena owning every task
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    next_tid: u32,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tid: TaskId) -> Option<&Task> {
        self.tasks.get(&tid)
    }

    pub fn get_mut(&mut self, tid: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&tid)
    }

    /// Look up a task that must exist
    pub fn expect(&self, tid: TaskId) -> &Task {
        match self.tasks.get(&tid) {
            Some(task) => task,
            None => panic!("task table: no such task {}", tid),
        }
    }

    pub fn expect_mut(&mut self, tid: TaskId) -> &mut Task {
        match self.tasks.get_mut(&tid) {
            Some(task) => task,
            None => panic!("task table: no such task {}", tid),
        }
    }

    /// Pick the next free id, wrapping at `MAX_TID`
    pub fn alloc_tid(&mut self, max_tasks: usize) -> KResult<TaskId> {
        if self.tasks.len() >= max_tasks {
            return Err(KernelError::TooManyTasks);
        }
        for _ in 0..MAX_TID {
            let tid = TaskId(self.next_tid);
            self.next_tid = (self.next_tid + 1) % MAX_TID;
            if !self.tasks.contains_key(&tid) {
                return Ok(tid);
            }
        }
        Err(KernelError::TooManyTasks)
    }

    pub fn insert(&mut self, task: Task) {
        let prev = self.tasks.insert(task.tid, task);
        assert!(prev.is_none(), "task table: duplicate task id");
    }

    pub fn remove(&mut self, tid: TaskId) -> Option<Task> {
        self.tasks.remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

impl QueueArena for TaskTable {
    fn chain(&self, id: TaskId, kind: ChainKind) -> &QueueChain {
        let task = self.expect(id);
        match kind {
            ChainKind::Sched => &task.sched_chain,
            ChainKind::Wait => &task.wait_chain,
        }
    }

    fn chain_mut(&mut self, id: TaskId, kind: ChainKind) -> &mut QueueChain {
        let task = self.expect_mut(id);
        match kind {
            ChainKind::Sched => &mut task.sched_chain,
            ChainKind::Wait => &mut task.wait_chain,
        }
    }
}

// ============================================================================
// Kernel threads
// ============================================================================

impl Kernel {
    /// Create a task with its own kernel stack and append it to the
    /// runnable list.
    ///
    /// A `pid` of `None` makes the task the main thread of a new process
    /// whose pid equals the task id; the caller registers the process.
    pub(crate) fn new_task(
        &mut self,
        pid: Option<Pid>,
        class: TaskClass,
        name: &str,
        body: Option<KthreadFn>,
        ip: usize,
        arg: usize,
    ) -> KResult<TaskId> {
        let tid = self.tasks.alloc_tid(self.config.max_tasks)?;
        let pid = pid.unwrap_or(Pid(tid.0));
        let stack_size = self.config.kernel_stack_size;

        self.disable_preemption();
        let stack = self.heaps.kmalloc(stack_size);
        self.enable_preemption_nosched();

        let Some(stack) = stack else {
            log::warn!("thread: no memory for the kernel stack of {}", name);
            return Err(KernelError::OutOfMemory);
        };
        let stack = KernelStack {
            base: stack.as_ptr() as usize,
            size: stack_size,
        };

        let join_obj = self.sync.create(SyncState::Queue);
        let mut task = Task::new(tid, pid, class, name, join_obj);
        task.kernel_stack = Some(stack);
        task.entry = body;
        task.context.arg = arg;
        self.platform.init_context(&mut task.context, ip, arg, stack.top());

        self.tasks.insert(task);
        if let Some(process) = self.processes.get_mut(&pid) {
            process.threads.push(tid);
        }

        if tid != TaskId::IDLE {
            self.disable_preemption();
            self.runnable.enqueue_tail(&mut self.tasks, tid);
            self.enable_preemption_nosched();
        }

        log::debug!("thread: created {} '{}' in {}", tid, name, pid);
        Ok(tid)
    }

    /// The boot task runs on the boot stack and is already running
    pub(crate) fn new_boot_task(&mut self, name: &str) -> KResult<TaskId> {
        let tid = self.tasks.alloc_tid(self.config.max_tasks)?;
        let join_obj = self.sync.create(SyncState::Queue);
        let mut task = Task::new(tid, Pid::KERNEL, TaskClass::Kernel, name, join_obj);
        task.state = TaskState::Running;

        self.tasks.insert(task);
        if let Some(process) = self.processes.get_mut(&Pid::KERNEL) {
            process.threads.push(tid);
        }
        Ok(tid)
    }

    /// Create a kernel thread running `entry(kernel, arg)`
    pub fn kthread_create(&mut self, entry: KthreadFn, arg: usize, name: &str) -> KResult<TaskId> {
        self.new_task(Some(Pid::KERNEL), TaskClass::Kernel, name, Some(entry), entry as usize, arg)
    }

    /// Terminate the current task with `code` and switch away from it
    pub fn kthread_exit(&mut self, code: i32) {
        let tid = self.current;
        assert!(tid != TaskId::IDLE, "kthread_exit: the idle task cannot exit");

        self.terminate_task(tid, code);
        self.do_schedule();
    }

    /// Wait for `tid` to exit and collect its exit code
    pub fn kthread_join(&mut self, tid: TaskId) -> Outcome<KResult<i32>> {
        if tid == self.current {
            return Outcome::Done(Err(KernelError::JoinSelf(tid.0)));
        }
        if tid == TaskId::IDLE {
            return Outcome::Done(Err(KernelError::NotPermitted("the idle task cannot be joined")));
        }
        let Some(task) = self.tasks.get(tid) else {
            return Outcome::Done(Err(KernelError::NoSuchTask(tid.0)));
        };

        if task.state == TaskState::Zombie {
            let code = task.exit_code.unwrap_or(0);
            self.reap(tid);
            return Outcome::Done(Ok(code));
        }

        self.disable_preemption();
        self.sleep_on(WaitObj::Task(tid), 0).map(|res| match res {
            WaitResult::Joined(code) => Ok(code),
            _ => Err(KernelError::NoSuchTask(tid.0)),
        })
    }

    /// Turn `tid` into a zombie and wake everyone joining it.
    ///
    /// A sleeping task is first detached from whatever it waits on. The
    /// caller switches away if `tid` is the current task.
    pub(crate) fn terminate_task(&mut self, tid: TaskId, code: i32) {
        self.disable_preemption();

        let state = self.tasks.expect(tid).state;
        assert!(state != TaskState::Zombie, "terminate: {} is already a zombie", tid);
        if state == TaskState::Sleeping {
            self.detach_from_wait(tid);
        }

        self.tasks.expect_mut(tid).exit_code = Some(code);
        self.change_state(tid, TaskState::Zombie);

        let join_obj = self.tasks.expect(tid).join_obj;
        let mut joiners = 0;
        while let Some(waiter) = self.sync.waiters_mut(join_obj).dequeue_head(&mut self.tasks) {
            self.wake_task(waiter, WaitResult::Joined(code));
            joiners += 1;
        }
        // the joiners got the exit code, nobody else needs the zombie
        self.tasks.expect_mut(tid).reap_when_off_cpu = joiners > 0;

        log::debug!("thread: {} exited with {}, {} joiners", tid, code, joiners);
        self.enable_preemption_nosched();
    }

    /// Destroy a zombie: free its kernel stack, its join object and its id
    pub(crate) fn reap(&mut self, tid: TaskId) {
        assert!(tid != self.current, "reap: {} is still on the CPU", tid);
        assert_eq!(
            self.tasks.expect(tid).state,
            TaskState::Zombie,
            "reap: {} is not a zombie",
            tid
        );

        self.disable_preemption();
        self.zombies.remove(&mut self.tasks, tid);
        if let Some(task) = self.tasks.remove(tid) {
            if let Some(stack) = task.kernel_stack {
                if let Some(ptr) = NonNull::new(stack.base as *mut u8) {
                    // SAFETY: the stack came from kmalloc in new_task with this size
                    unsafe { self.heaps.kfree2(ptr, stack.size) };
                }
            }
            self.sync.remove(task.join_obj);
            self.process_remove_thread(task.pid, tid);
        }
        self.enable_preemption_nosched();

        log::debug!("thread: reaped {}", tid);
    }

    pub(crate) fn reap_off_cpu_zombies(&mut self) {
        if self.zombies.is_empty() {
            return;
        }
        let ready: Vec<TaskId> = self
            .zombies
            .iter(&self.tasks)
            .filter(|&tid| tid != self.current && self.tasks.expect(tid).reap_when_off_cpu)
            .collect();
        for tid in ready {
            self.reap(tid);
        }
    }
}

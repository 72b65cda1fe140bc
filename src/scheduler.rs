//! Task scheduler
//!
//! The [`Kernel`] context object owns all scheduler state: the task arena,
//! the runnable/sleeping/zombie lists, the current task, the heap
//! directory, the synchronization objects, the wakeup timers and the
//! tasklet runners. There is no global instance; every kernel operation
//! is a method on `Kernel`.
//!
//! Scheduling is round-robin over the runnable list. A tasklet runner
//! with pending jobs is preferred, lowest priority number first. The idle
//! task is never linked into the runnable list and runs when nothing else
//! can.
//!
//! Mutual exclusion is a nestable preemption counter: there is one CPU,
//! and a timer tick arriving while the counter is non-zero only records
//! that a reschedule is due. The `enable_preemption` that brings the
//! counter back to zero honors it.
//!
//! ## Hosted execution
//!
//! Blocking calls return [`Outcome::Blocked`](crate::kern::sched_prim::Outcome)
//! once the calling task went to sleep and the CPU was switched away. The
//! wake reason is collected with [`Kernel::take_wait_result`] when the task
//! runs again.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::error::KResult;
use crate::kern::kalloc::HeapDirectory;
use crate::kern::lock::SyncTable;
use crate::kern::queue::{ChainKind, QueueHead};
use crate::kern::sched_prim::WaitResult;
use crate::kern::task::Process;
use crate::kern::tasklet::TaskletRunners;
use crate::kern::thread::{Task, TaskClass, TaskState, TaskTable};
use crate::kern::timer::TimerQueue;
use crate::types::{Pid, TaskId, Ticks};

/// Scheduler statistics
#[derive(Debug, Default)]
pub struct SchedStats {
    /// Total context switches
    pub context_switches: AtomicU64,
    /// Total ticks
    pub ticks: AtomicU64,
    /// Idle ticks
    pub idle_ticks: AtomicU64,
}

/// The kernel context: scheduler, heaps and synchronization state
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) heaps: HeapDirectory,
    pub(crate) tasks: TaskTable,
    pub(crate) runnable: QueueHead,
    pub(crate) sleeping: QueueHead,
    pub(crate) zombies: QueueHead,
    pub(crate) current: TaskId,
    pub(crate) processes: BTreeMap<Pid, Process>,
    pub(crate) sync: SyncTable,
    pub(crate) timers: TimerQueue,
    pub(crate) tasklets: TaskletRunners,
    pub(crate) platform: Box<dyn Platform>,
    preempt_count: AtomicU32,
    need_resched: bool,
    ticks: Ticks,
    stats: SchedStats,
}

impl Kernel {
    /// Bring up the scheduler.
    ///
    /// Creates the kernel process (pid 0), the idle task (tid 0), the boot
    /// task "init" which becomes the running task, and the default tasklet
    /// runner. Preemption is enabled on return.
    pub fn new(config: KernelConfig, heaps: HeapDirectory, platform: Box<dyn Platform>) -> KResult<Self> {
        config.validate()?;

        let mut k = Kernel {
            config,
            heaps,
            tasks: TaskTable::new(),
            runnable: QueueHead::new(ChainKind::Sched),
            sleeping: QueueHead::new(ChainKind::Sched),
            zombies: QueueHead::new(ChainKind::Sched),
            current: TaskId::IDLE,
            processes: BTreeMap::new(),
            sync: SyncTable::new(),
            timers: TimerQueue::new(),
            tasklets: TaskletRunners::new(),
            platform,
            preempt_count: AtomicU32::new(1),
            need_resched: false,
            ticks: 0,
            stats: SchedStats::default(),
        };

        k.processes.insert(Pid::KERNEL, Process::new(Pid::KERNEL, None, "kernel"));

        let idle = k.new_task(Some(Pid::KERNEL), TaskClass::Kernel, "idle", Some(idle_main), idle_main as usize, 0)?;
        assert_eq!(idle, TaskId::IDLE, "idle must be the first task");

        let boot = k.new_boot_task("init")?;
        k.current = boot;

        let queue_size = k.config.tasklet_queue_size;
        k.create_tasklet_runner(0, queue_size)?;

        k.preempt_count.store(0, Ordering::Release);
        log::info!(
            "sched: initialized, {} heaps, time slice {} ticks",
            k.heaps.heap_count(),
            k.config.time_slice_ticks
        );
        Ok(k)
    }

    // ========================================================================
    // Preemption
    // ========================================================================

    pub fn disable_preemption(&self) {
        self.preempt_count.fetch_add(1, Ordering::Acquire);
    }

    /// Re-enable preemption, running a deferred reschedule when the count
    /// drops to zero
    pub fn enable_preemption(&mut self) {
        if self.enable_preemption_nosched() == 0 && self.need_resched {
            self.schedule();
        }
    }

    /// Re-enable preemption without honoring a pending reschedule.
    /// Returns the new count.
    pub fn enable_preemption_nosched(&self) -> u32 {
        let prev = self.preempt_count.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "enable_preemption: preemption is not disabled");
        prev - 1
    }

    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(Ordering::Relaxed)
    }

    pub fn is_preemption_enabled(&self) -> bool {
        self.preempt_count() == 0
    }

    pub(crate) fn set_preempt_count(&self, count: u32) {
        self.preempt_count.store(count, Ordering::Release);
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Give up the CPU. The current task, if still running, goes to the
    /// tail of the runnable list.
    pub fn schedule(&mut self) {
        assert!(
            self.is_preemption_enabled(),
            "schedule: called with preemption disabled ({})",
            self.preempt_count()
        );
        self.do_schedule();
    }

    pub(crate) fn do_schedule(&mut self) {
        self.disable_preemption();
        self.need_resched = false;

        let prev = self.current;
        if self.tasks.expect(prev).state == TaskState::Running {
            self.change_state(prev, TaskState::Runnable);
        }

        let next = self.pick_next();
        self.switch_to(prev, next);
        self.enable_preemption_nosched();

        self.reap_off_cpu_zombies();
    }

    fn pick_next(&self) -> TaskId {
        for runner in self.tasklets.iter() {
            if runner.has_work() && self.tasks.expect(runner.task).state == TaskState::Runnable {
                return runner.task;
            }
        }
        self.runnable.first().unwrap_or(TaskId::IDLE)
    }

    fn switch_to(&mut self, prev: TaskId, next: TaskId) {
        if prev != next {
            let ctx = &mut self.tasks.expect_mut(prev).context;
            self.platform.save_context(prev, ctx);
            self.stats.context_switches.fetch_add(1, Ordering::Relaxed);
            log::trace!("sched: switch {} -> {}", prev, next);
        }

        self.change_state(next, TaskState::Running);
        self.tasks.expect_mut(next).ticks.timeslot = 0;
        self.current = next;

        if prev != next {
            let ctx = &self.tasks.expect(next).context;
            self.platform.restore_context(next, ctx);
        }
    }

    /// Move a task to `state`, keeping the scheduler lists in sync
    pub(crate) fn change_state(&mut self, tid: TaskId, state: TaskState) {
        self.disable_preemption();

        let old = self.tasks.expect(tid).state;
        if tid != TaskId::IDLE {
            let list = match old {
                TaskState::Runnable => Some(&mut self.runnable),
                TaskState::Sleeping => Some(&mut self.sleeping),
                TaskState::Zombie => Some(&mut self.zombies),
                TaskState::Running => None,
            };
            if let Some(list) = list {
                list.remove(&mut self.tasks, tid);
            }
        }

        self.tasks.expect_mut(tid).state = state;

        if tid != TaskId::IDLE {
            let list = match state {
                TaskState::Runnable => Some(&mut self.runnable),
                TaskState::Sleeping => Some(&mut self.sleeping),
                TaskState::Zombie => Some(&mut self.zombies),
                TaskState::Running => None,
            };
            if let Some(list) = list {
                list.enqueue_tail(&mut self.tasks, tid);
            }
        }

        self.enable_preemption_nosched();
    }

    /// Timer interrupt: account the tick, fire expired wakeup timers and
    /// preempt the current task at the end of its time slice
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let curr = self.current;
        {
            let task = self.tasks.expect_mut(curr);
            let user = task.class == TaskClass::User;
            task.ticks.update(user);
        }
        if curr == TaskId::IDLE {
            self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
        }

        for tid in self.timers.process(self.ticks) {
            self.on_wakeup_timer(tid);
        }

        if self.need_reschedule() {
            if self.is_preemption_enabled() {
                self.do_schedule();
            } else {
                self.need_resched = true;
            }
        }
    }

    fn need_reschedule(&self) -> bool {
        let task = self.tasks.expect(self.current);

        if self.need_resched || task.state != TaskState::Running {
            return true;
        }
        if self.current == TaskId::IDLE {
            return !self.runnable.is_empty();
        }
        task.ticks.timeslot >= u64::from(self.config.time_slice_ticks)
    }

    /// Run the body of the current task.
    ///
    /// A task body is a step function: it runs until it returns or blocks.
    /// A kernel thread whose body returns while it is still running exits
    /// with code 0. Returns false if the current task has no body.
    pub fn run_current_task(&mut self) -> bool {
        let tid = self.current;
        let Some(entry) = self.tasks.expect(tid).entry else {
            return false;
        };
        let arg = self.tasks.expect(tid).context.arg;

        entry(self, arg);

        if tid != TaskId::IDLE
            && self.current == tid
            && self.tasks.get(tid).map(|t| t.state) == Some(TaskState::Running)
        {
            self.kthread_exit(0);
        }
        true
    }

    /// Idle step: let the platform wait for an interrupt, then pick up
    /// anything that became runnable
    pub fn idle_step(&mut self) {
        self.platform.idle();
        if !self.runnable.is_empty() {
            self.schedule();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    pub fn current_pid(&self) -> Pid {
        self.tasks.expect(self.current).pid
    }

    pub fn task(&self, tid: TaskId) -> Option<&Task> {
        self.tasks.get(tid)
    }

    pub fn task_state(&self, tid: TaskId) -> Option<TaskState> {
        self.tasks.get(tid).map(|t| t.state)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Runnable tasks in scheduling order
    pub fn runnable_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.runnable.iter(&self.tasks)
    }

    /// Number of tasks currently in the RUNNING state
    pub fn running_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.state == TaskState::Running).count()
    }

    /// Collect why the current task was last woken up
    pub fn take_wait_result(&mut self) -> Option<WaitResult> {
        let tid = self.current;
        self.tasks.expect_mut(tid).wait_result.take()
    }

    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn heaps(&self) -> &HeapDirectory {
        &self.heaps
    }

    pub fn heaps_mut(&mut self) -> &mut HeapDirectory {
        &mut self.heaps
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    // ========================================================================
    // Memory
    // ========================================================================

    pub fn kmalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.disable_preemption();
        let ptr = self.heaps.kmalloc(size);
        self.enable_preemption();
        ptr
    }

    pub fn kzmalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.disable_preemption();
        let ptr = self.heaps.kzmalloc(size);
        self.enable_preemption();
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Kernel::kmalloc`] and not have been freed.
    pub unsafe fn kfree(&mut self, ptr: NonNull<u8>) {
        self.disable_preemption();
        // SAFETY: forwarded caller contract
        unsafe { self.heaps.kfree(ptr) };
        self.enable_preemption();
    }

    /// # Safety
    ///
    /// As [`Kernel::kfree`]; `size` must be the size passed to `kmalloc`.
    pub unsafe fn kfree2(&mut self, ptr: NonNull<u8>, size: usize) {
        self.disable_preemption();
        // SAFETY: forwarded caller contract
        unsafe { self.heaps.kfree2(ptr, size) };
        self.enable_preemption();
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("current", &self.current)
            .field("tasks", &self.tasks.len())
            .field("runnable", &self.runnable.len())
            .field("sleeping", &self.sleeping.len())
            .field("zombies", &self.zombies.len())
            .field("preempt_count", &self.preempt_count())
            .field("ticks", &self.ticks)
            .finish()
    }
}

fn idle_main(k: &mut Kernel, _arg: usize) {
    k.idle_step();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::hosted_kernel;

    fn kernel() -> Kernel {
        hosted_kernel(KernelConfig::new()).unwrap().0
    }

    fn nop(_k: &mut Kernel, _arg: usize) {}

    #[test]
    fn test_boot_state() {
        let k = kernel();
        assert_eq!(k.current(), TaskId(1));
        assert_eq!(k.task(TaskId(1)).unwrap().name(), "init");
        assert_eq!(k.task_state(TaskId::IDLE), Some(TaskState::Runnable));
        assert_eq!(k.running_count(), 1);
        assert!(k.is_preemption_enabled());
        // the default tasklet runner sleeps until it gets work
        assert_eq!(k.task_state(TaskId(2)), Some(TaskState::Sleeping));
        assert_eq!(k.runnable_tasks().count(), 0);
    }

    #[test]
    fn test_round_robin() {
        let mut k = kernel();
        let a = k.kthread_create(nop, 0, "a").unwrap();
        let b = k.kthread_create(nop, 0, "b").unwrap();

        k.schedule();
        assert_eq!(k.current(), a);
        k.schedule();
        assert_eq!(k.current(), b);
        k.schedule();
        assert_eq!(k.current(), TaskId(1));
        assert_eq!(k.running_count(), 1);
        assert_eq!(k.stats().context_switches.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_schedule_alone_keeps_running() {
        let mut k = kernel();
        k.schedule();
        assert_eq!(k.current(), TaskId(1));
        assert_eq!(k.stats().context_switches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_time_slice_preemption() {
        let mut k = kernel();
        let a = k.kthread_create(nop, 0, "a").unwrap();
        let slice = k.config().time_slice_ticks;

        for _ in 0..slice - 1 {
            k.tick();
        }
        assert_eq!(k.current(), TaskId(1));
        k.tick();
        assert_eq!(k.current(), a);
        assert_eq!(k.task(TaskId(1)).unwrap().ticks().total, u64::from(slice));
    }

    #[test]
    fn test_preemption_is_deferred() {
        let mut k = kernel();
        let a = k.kthread_create(nop, 0, "a").unwrap();

        k.disable_preemption();
        k.disable_preemption();
        for _ in 0..k.config().time_slice_ticks + 5 {
            k.tick();
        }
        assert_eq!(k.current(), TaskId(1));

        k.enable_preemption();
        assert_eq!(k.current(), TaskId(1));
        k.enable_preemption();
        assert_eq!(k.current(), a);
    }

    #[test]
    #[should_panic(expected = "preemption disabled")]
    fn test_schedule_with_preemption_disabled_panics() {
        let mut k = kernel();
        k.disable_preemption();
        k.schedule();
    }

    #[test]
    #[should_panic(expected = "not disabled")]
    fn test_unbalanced_enable_panics() {
        let mut k = kernel();
        k.enable_preemption();
    }

    #[test]
    fn test_body_runs_and_exits() {
        fn body(k: &mut Kernel, arg: usize) {
            let p = k.kmalloc(arg).unwrap();
            unsafe { k.kfree(p) };
        }

        let mut k = kernel();
        let t = k.kthread_create(body, 128, "body").unwrap();
        k.schedule();
        assert_eq!(k.current(), t);
        assert!(k.run_current_task());
        assert_eq!(k.task_state(t), Some(TaskState::Zombie));
        assert_eq!(k.current(), TaskId(1));
        // the boot task has no body
        assert!(!k.run_current_task());
    }

    #[test]
    fn test_idle_runs_when_nothing_is_runnable() {
        let mut k = kernel();
        let a = k.kthread_create(nop, 0, "a").unwrap();
        k.schedule();
        assert_eq!(k.current(), a);

        // park the boot task, then let a exit
        let init = TaskId(1);
        k.change_state(init, TaskState::Sleeping);
        k.kthread_exit(0);
        assert_eq!(k.current(), TaskId::IDLE);

        k.tick();
        assert_eq!(k.stats().idle_ticks.load(Ordering::Relaxed), 1);

        k.wake_task(init, WaitResult::Awakened);
        k.tick();
        assert_eq!(k.current(), init);
    }
}

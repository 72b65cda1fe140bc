//! Process Management
//!
//! A process is a container for tasks and per-process resources:
//! - The tasks (threads) running in it
//! - Its children, for `waitpid`
//! - The mmap heap backing its anonymous memory mappings
//!
//! The kernel process (pid 0) owns every kernel thread and adopts the
//! children of exiting processes. A user process' pid is the task id of
//! its main thread, so waiting for a process is joining that task.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KResult, KernelError};
use crate::kern::heap::Heap;
use crate::kern::sched_prim::Outcome;
use crate::kern::thread::{TaskClass, TaskContext, TaskState};
use crate::scheduler::Kernel;
use crate::types::{Pid, TaskId};

/// A process
#[derive(Debug)]
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    pub(crate) name: heapless::String<32>,
    pub(crate) threads: Vec<TaskId>,
    pub(crate) children: Vec<Pid>,
    pub(crate) mmap_heap: Option<Heap>,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>, name: &str) -> Self {
        let mut short = heapless::String::new();
        for c in name.chars() {
            if short.push(c).is_err() {
                break;
            }
        }

        Self {
            pid,
            parent,
            name: short,
            threads: Vec::new(),
            children: Vec::new(),
            mmap_heap: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> &[TaskId] {
        &self.threads
    }

    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub fn mmap_heap(&self) -> Option<&Heap> {
        self.mmap_heap.as_ref()
    }
}

impl Kernel {
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn register_process(&mut self, tid: TaskId, parent: Pid, name: &str, mmap_heap: Option<Heap>) -> Pid {
        let pid = Pid(tid.0);
        let mut process = Process::new(pid, Some(parent), name);
        process.threads = vec![tid];
        process.mmap_heap = mmap_heap;
        self.processes.insert(pid, process);

        if let Some(p) = self.processes.get_mut(&parent) {
            p.children.push(pid);
        }
        pid
    }

    /// Create a user process with a single task that starts at `entry`
    /// with the user stack at `user_sp`. The new process is a child of the
    /// current process.
    pub fn create_usermode_process(&mut self, name: &str, entry: usize, user_sp: usize) -> KResult<Pid> {
        let parent = self.current_pid();
        let tid = self.new_task(None, TaskClass::User, name, None, entry, 0)?;
        self.tasks.expect_mut(tid).context.user_sp = user_sp;

        let pid = self.register_process(tid, parent, name, None);
        log::debug!("process: created {} '{}' (parent {})", pid, name, parent);
        Ok(pid)
    }

    /// Duplicate the current user process.
    ///
    /// The child runs the same code on the same user stack, sees 0 as the
    /// return value and gets a copy of the parent's mmap heap metadata.
    pub fn fork_current_process(&mut self) -> KResult<Pid> {
        let parent_tid = self.current;
        let parent = self.tasks.expect(parent_tid);
        if parent.class != TaskClass::User {
            return Err(KernelError::NotPermitted("only user processes can fork"));
        }
        let parent_pid = parent.pid;
        let ctx = parent.context;
        let body = parent.entry;
        let name = parent.name.clone();

        let mmap_heap = match self.processes.get(&parent_pid).and_then(|p| p.mmap_heap.as_ref()) {
            Some(heap) => Some(heap.dup()?),
            None => None,
        };

        let tid = self.new_task(None, TaskClass::User, &name, body, ctx.ip, ctx.arg)?;
        {
            let child = self.tasks.expect_mut(tid);
            child.context = TaskContext {
                sp: child.context.sp,
                retval: 0,
                ..ctx
            };
        }

        let pid = self.register_process(tid, parent_pid, &name, mmap_heap);
        log::debug!("process: {} forked {}", parent_pid, pid);
        Ok(pid)
    }

    /// Terminate every task of the current process with `code`.
    ///
    /// The mmap heap is released and the children are adopted by the
    /// kernel process. The calling task becomes a zombie until its parent
    /// collects the code with [`Kernel::waitpid`].
    pub fn exit_current_process(&mut self, code: i32) {
        let tid = self.current;
        let pid = self.current_pid();
        assert!(pid != Pid::KERNEL, "exit_current_process: kernel threads use kthread_exit");

        self.disable_preemption();

        let (threads, children, heap) = match self.processes.get_mut(&pid) {
            Some(p) => (
                p.threads.clone(),
                core::mem::take(&mut p.children),
                p.mmap_heap.take(),
            ),
            None => (Vec::new(), Vec::new(), None),
        };

        for t in threads {
            if t != tid && self.task_state(t) != Some(TaskState::Zombie) {
                self.terminate_task(t, code);
            }
        }

        if let Some(mut heap) = heap {
            heap.unmap_all();
        }

        for child in &children {
            if let Some(c) = self.processes.get_mut(child) {
                c.parent = Some(Pid::KERNEL);
            }
        }
        if let Some(kernel) = self.processes.get_mut(&Pid::KERNEL) {
            kernel.children.extend_from_slice(&children);
        }

        log::debug!("process: {} exiting with {}", pid, code);
        self.terminate_task(tid, code);
        self.enable_preemption_nosched();
        self.do_schedule();
    }

    /// Wait for the child process `pid` to exit and collect its code
    pub fn waitpid(&mut self, pid: Pid) -> Outcome<KResult<i32>> {
        let me = self.current_pid();
        match self.processes.get(&pid) {
            None => Outcome::Done(Err(KernelError::NoSuchTask(pid.0))),
            Some(p) if p.parent != Some(me) => {
                Outcome::Done(Err(KernelError::NotPermitted("not a child of the caller")))
            }
            Some(_) => self.kthread_join(TaskId::from(pid)),
        }
    }

    /// Install the mmap heap of the current process
    pub fn set_mmap_heap(&mut self, heap: Heap) -> KResult<()> {
        let pid = self.current_pid();
        if pid == Pid::KERNEL {
            return Err(KernelError::NotPermitted("the kernel process has no mmap heap"));
        }
        match self.processes.get_mut(&pid) {
            Some(p) => {
                p.mmap_heap = Some(heap);
                Ok(())
            }
            None => Err(KernelError::NoSuchTask(pid.0)),
        }
    }

    pub fn mmap_heap_mut(&mut self) -> Option<&mut Heap> {
        let pid = self.current_pid();
        self.processes.get_mut(&pid).and_then(|p| p.mmap_heap.as_mut())
    }

    /// Drop a reaped task from its process; an empty user process goes away
    pub(crate) fn process_remove_thread(&mut self, pid: Pid, tid: TaskId) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.threads.retain(|&t| t != tid);
        if !process.threads.is_empty() || pid == Pid::KERNEL {
            return;
        }

        if let Some(process) = self.processes.remove(&pid) {
            if let Some(parent) = process.parent.and_then(|p| self.processes.get_mut(&p)) {
                parent.children.retain(|&c| c != pid);
            }
            log::debug!("process: {} destroyed", pid);
        }
    }
}

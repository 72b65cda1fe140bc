//! Whole-kernel scenarios on the hosted platform

use kcore::arch::hosted::{hosted_kernel, HostedTrace, HostedUserMemory, HostedVm};
use kcore::kern::copyio::{CopyError, CpuFault};
use kcore::kern::lock::MutexFlags;
use kcore::kern::thread::TaskState;
use kcore::{Kernel, KernelConfig, KernelError, Outcome, Pid, TaskId, WaitObj, WaitResult};
use spin::Mutex;

fn kernel() -> (Kernel, HostedTrace) {
    hosted_kernel(KernelConfig::new()).unwrap()
}

fn nop(_k: &mut Kernel, _arg: usize) {}

/// Schedule until `tid` is on the CPU
fn run_until(k: &mut Kernel, tid: TaskId) {
    for _ in 0..64 {
        if k.current() == tid {
            return;
        }
        k.schedule();
    }
    panic!("{} never got the CPU", tid);
}

// ============================================================================
// Heap
// ============================================================================

#[test]
fn test_scenario_a_heap_round_trip() {
    let vm = HostedVm::new();
    let mut heap = vm.linear_heap(1 << 20, 32).unwrap();

    let blocks: Vec<usize> = (0..100).map(|_| heap.alloc(40).unwrap()).collect();
    assert_eq!(heap.mem_allocated(), 100 * 64);
    for &b in &blocks {
        assert_eq!(heap.block_size(b), 64);
    }
    for &b in &blocks {
        heap.free(b, 40);
    }
    assert_eq!(heap.mem_allocated(), 0);

    // the metadata lives outside the heap: the whole range is available
    let all = heap.alloc(1 << 20).unwrap();
    assert_eq!(all, heap.vaddr());
    heap.free(all, 1 << 20);
}

#[test]
fn test_kmalloc_through_kernel() {
    let (mut k, _) = kernel();
    let before = k.heaps().mem_allocated();

    let p = k.kzmalloc(300).unwrap();
    assert_eq!(k.heaps().mem_allocated(), before + 512);
    unsafe { k.kfree2(p, 300) };
    assert_eq!(k.heaps().mem_allocated(), before);
    assert!(k.is_preemption_enabled());
}

#[test]
fn test_kmalloc_of_impossible_sizes() {
    let (mut k, _) = kernel();
    let before = k.heaps().mem_allocated();
    let heaps = k.heaps().heap_count();

    assert_eq!(k.kmalloc(usize::MAX), None);
    assert_eq!(k.kzmalloc(usize::MAX - 4095), None);
    assert_eq!(k.kmalloc(0), None);
    assert_eq!(k.heaps().mem_allocated(), before);
    assert_eq!(k.heaps().heap_count(), heaps);
    assert!(k.is_preemption_enabled());
}

// ============================================================================
// Scheduler
// ============================================================================

#[test]
fn test_exactly_one_task_running() {
    let (mut k, trace) = kernel();
    for i in 0..4 {
        k.kthread_create(nop, i, "worker").unwrap();
    }

    for _ in 0..100 {
        k.tick();
        assert_eq!(k.running_count(), 1);
        let curr = k.current();
        assert_eq!(k.task_state(curr), Some(TaskState::Running));
        assert!(k.runnable_tasks().all(|t| t != curr));
    }
    assert!(trace.switches().len() >= 9);
}

#[test]
fn test_sleep_and_join() {
    fn sleeper(k: &mut Kernel, ticks: usize) {
        // first step: go to sleep; second step: exit
        if k.take_wait_result().is_none() {
            let _ = k.kernel_sleep(ticks as u64);
        } else {
            k.kthread_exit(7);
        }
    }

    let (mut k, _) = kernel();
    let init = k.current();
    let t = k.kthread_create(sleeper, 3, "sleeper").unwrap();

    assert!(k.kthread_join(t).is_blocked());
    assert_eq!(k.current(), t);
    assert!(k.run_current_task());
    assert_eq!(k.task(t).unwrap().wait_obj(), WaitObj::Timer);
    assert_eq!(k.current(), TaskId::IDLE);

    for _ in 0..3 {
        k.tick();
    }
    assert_eq!(k.current(), t);
    assert!(k.run_current_task());

    assert_eq!(k.current(), init);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Joined(7)));
    // the joiner already has the code: the zombie is gone
    assert_eq!(k.task_state(t), None);
}

#[test]
fn test_join_errors() {
    let (mut k, _) = kernel();
    let me = k.current();
    assert_eq!(k.kthread_join(me), Outcome::Done(Err(KernelError::JoinSelf(me.0))));
    assert_eq!(
        k.kthread_join(TaskId(999)),
        Outcome::Done(Err(KernelError::NoSuchTask(999)))
    );
}

// ============================================================================
// Synchronization
// ============================================================================

#[test]
fn test_scenario_b_mutex_contention() {
    let (mut k, _) = kernel();
    let a = k.current();
    let b = k.kthread_create(nop, 0, "b").unwrap();
    let m = k.kmutex_init(MutexFlags::empty());

    assert_eq!(k.kmutex_lock(m), Outcome::Done(()));
    run_until(&mut k, b);
    assert!(!k.kmutex_trylock(m));
    assert!(k.kmutex_lock(m).is_blocked());
    assert_eq!(k.current(), a);

    k.kmutex_unlock(m);
    run_until(&mut k, b);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Awakened));
    assert!(k.kmutex_is_curr_task_holding_lock(m));
    k.kmutex_unlock(m);
    k.kmutex_destroy(m);
}

#[test]
fn test_mutex_wakes_waiters_in_fifo_order() {
    let (mut k, _) = kernel();
    let m = k.kmutex_init(MutexFlags::empty());
    let _ = k.kmutex_lock(m);
    let waiters: Vec<TaskId> = (0..3).map(|_| k.kthread_create(nop, 0, "w").unwrap()).collect();

    for &w in &waiters {
        run_until(&mut k, w);
        assert!(k.kmutex_lock(m).is_blocked());
    }

    let mut order = Vec::new();
    k.kmutex_unlock(m);
    for _ in 0..3 {
        let owner = k.kmutex_owner(m).unwrap();
        order.push(owner);
        run_until(&mut k, owner);
        k.kmutex_unlock(m);
    }
    assert_eq!(order, waiters);
    assert_eq!(k.kmutex_owner(m), None);
}

#[test]
fn test_condvar_wait_times_out() {
    let (mut k, _) = kernel();
    let init = k.current();
    let m = k.kmutex_init(MutexFlags::empty());
    let c = k.kcond_init();

    let _ = k.kmutex_lock(m);
    assert!(k.kcond_wait(c, m, 5).is_blocked());
    assert_eq!(k.kmutex_owner(m), None);

    for _ in 0..4 {
        k.tick();
        assert_eq!(k.task_state(init), Some(TaskState::Sleeping));
    }
    k.tick();
    assert_eq!(k.current(), init);
    assert_eq!(k.take_wait_result(), Some(WaitResult::TimedOut));
    assert_eq!(k.kmutex_owner(m), Some(init));
    k.kmutex_unlock(m);
}

#[test]
fn test_condvar_longest_timeout_still_signalled() {
    let (mut k, _) = kernel();
    let init = k.current();
    let m = k.kmutex_init(MutexFlags::empty());
    let c = k.kcond_init();
    let a = k.kthread_create(nop, 0, "a").unwrap();
    k.tick();

    let _ = k.kmutex_lock(m);
    assert!(k.kcond_wait(c, m, u64::MAX).is_blocked());
    run_until(&mut k, a);
    for _ in 0..10 {
        k.tick();
    }
    assert_eq!(k.task_state(init), Some(TaskState::Sleeping));

    k.kcond_signal_one(c);
    assert_eq!(k.kmutex_owner(m), Some(init));
    run_until(&mut k, init);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Awakened));
    k.kmutex_unlock(m);
}

#[test]
fn test_semaphore_longest_timeout() {
    let (mut k, _) = kernel();
    let init = k.current();
    let s = k.ksem_init(0, None).unwrap();
    k.tick();

    assert!(k.ksem_wait(s, u64::MAX).is_blocked());
    k.tick();
    assert_eq!(k.task_state(init), Some(TaskState::Sleeping));
    k.ksem_signal(s).unwrap();
    run_until(&mut k, init);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Awakened));
    assert_eq!(k.ksem_value(s), 0);
}

#[test]
fn test_condvar_signal_all() {
    let (mut k, _) = kernel();
    let init = k.current();
    let m = k.kmutex_init(MutexFlags::empty());
    let c = k.kcond_init();
    let a = k.kthread_create(nop, 0, "a").unwrap();
    let b = k.kthread_create(nop, 0, "b").unwrap();

    for &t in &[a, b] {
        run_until(&mut k, t);
        let _ = k.kmutex_lock(m);
        assert!(k.kcond_wait(c, m, 0).is_blocked());
    }
    run_until(&mut k, init);
    k.kcond_signal_all(c);

    // both woke, the mutex goes to them one at a time
    assert_eq!(k.kmutex_owner(m), Some(a));
    run_until(&mut k, a);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Awakened));
    k.kmutex_unlock(m);
    assert_eq!(k.kmutex_owner(m), Some(b));
}

#[test]
fn test_semaphore() {
    let (mut k, _) = kernel();
    let init = k.current();
    let s = k.ksem_init(1, Some(1)).unwrap();
    let a = k.kthread_create(nop, 0, "a").unwrap();

    assert_eq!(k.ksem_wait(s, 0), Outcome::Done(true));
    assert_eq!(k.ksem_signal(s), Ok(()));
    assert_eq!(k.ksem_signal(s), Err(KernelError::SemOverflow));
    assert!(k.ksem_trywait(s));
    assert!(!k.ksem_trywait(s));

    run_until(&mut k, a);
    assert!(k.ksem_wait(s, 0).is_blocked());
    assert_eq!(k.current(), init);
    assert_eq!(k.ksem_value(s), -1);

    k.ksem_signal(s).unwrap();
    assert_eq!(k.task_state(a), Some(TaskState::Runnable));
    assert_eq!(k.ksem_value(s), 0);
    run_until(&mut k, a);
    assert_eq!(k.take_wait_result(), Some(WaitResult::Awakened));
}

#[test]
fn test_semaphore_timeout_gives_unit_back() {
    let (mut k, _) = kernel();
    let init = k.current();
    let s = k.ksem_init(0, None).unwrap();

    assert!(k.ksem_wait(s, 2).is_blocked());
    assert_eq!(k.ksem_value(s), -1);
    k.tick();
    k.tick();
    assert_eq!(k.current(), init);
    assert_eq!(k.take_wait_result(), Some(WaitResult::TimedOut));
    assert_eq!(k.ksem_value(s), 0);
}

#[test]
fn test_rwlock_prefers_writers() {
    let (mut k, _) = kernel();
    let init = k.current();
    let l = k.rwlock_init(false);
    let w = k.kthread_create(nop, 0, "writer").unwrap();
    let r = k.kthread_create(nop, 0, "reader").unwrap();

    assert_eq!(k.rwlock_shlock(l), Outcome::Done(()));
    run_until(&mut k, w);
    assert!(k.rwlock_exlock(l).is_blocked());
    run_until(&mut k, r);
    // a writer is waiting: new readers queue up
    assert!(k.rwlock_shlock(l).is_blocked());

    run_until(&mut k, init);
    k.rwlock_shunlock(l);
    assert_eq!(k.rwlock_writer(l), Some(w));

    run_until(&mut k, w);
    k.rwlock_exunlock(l);
    assert_eq!(k.rwlock_readers(l), 1);
    assert_eq!(k.task_state(r), Some(TaskState::Runnable));

    run_until(&mut k, r);
    k.rwlock_shunlock(l);
    k.rwlock_destroy(l);
}

// ============================================================================
// Tasklets
// ============================================================================

static DRAINED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn record(_k: &mut Kernel, v: usize) {
    DRAINED.lock().push(v);
}

#[test]
fn test_scenario_c_tasklet_queue() {
    let (mut k, _) = hosted_kernel(KernelConfig::new().with_tasklet_queue_size(8)).unwrap();
    let init = k.current();

    for i in 0..8 {
        assert!(k.enqueue_tasklet1(0, record, i));
    }
    assert!(!k.enqueue_tasklet1(0, record, 8));
    assert_eq!(k.pending_tasklets(0), 8);

    k.schedule();
    let runner = k.tasklet_runner(0).unwrap().task();
    assert_eq!(k.current(), runner);
    assert!(k.run_current_task());

    assert_eq!(*DRAINED.lock(), (0..8).collect::<Vec<_>>());
    assert_eq!(k.current(), init);
    assert_eq!(k.task_state(runner), Some(TaskState::Sleeping));

    // room again after the drain
    assert!(k.enqueue_tasklet1(0, record, 8));
}

// ============================================================================
// Processes and faults
// ============================================================================

#[test]
fn test_fork_exit_waitpid() {
    let (mut k, _) = kernel();
    let parent = k.create_usermode_process("sh", 0x40_1000, 0x7fff_0000).unwrap();
    run_until(&mut k, TaskId::from(parent));

    let child = k.fork_current_process().unwrap();
    assert!(k.waitpid(child).is_blocked());

    run_until(&mut k, TaskId::from(child));
    assert_eq!(k.current_pid(), child);
    assert_eq!(k.task(k.current()).unwrap().context().retval, 0);
    k.exit_current_process(42);

    run_until(&mut k, TaskId::from(parent));
    assert_eq!(k.take_wait_result(), Some(WaitResult::Joined(42)));
    assert!(k.process(child).is_none());
    assert!(k.process(parent).unwrap().children().is_empty());
    assert!(matches!(k.waitpid(Pid(500)), Outcome::Done(Err(KernelError::NoSuchTask(500)))));
}

#[test]
fn test_user_copy_faults_are_recovered() {
    let (mut k, trace) = kernel();
    let mut mem = HostedUserMemory::new();
    mem.map(0x80_0000, 2, true);

    let msg = b"/bin/init\0";
    assert_eq!(k.copy_to_user(&mut mem, 0x80_0ff8, msg), Ok(msg.len()));
    let mut path = [0u8; 64];
    assert_eq!(k.copy_str_from_user(&mem, 0x80_0ff8, &mut path), Ok(9));
    assert_eq!(&path[..9], b"/bin/init");

    mem.unmap(0x80_1000, 1);
    assert_eq!(k.copy_str_from_user(&mem, 0x80_0ff8, &mut path), Err(CopyError::PageFault));

    let me = k.current();
    assert_eq!(trace.faults(), [(me, CpuFault::PAGE_FAULT, true)]);
    assert!(k.is_preemption_enabled());
}

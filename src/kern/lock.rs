//! Locking Primitives
//!
//! Sleeping synchronization objects built on the task wait mechanism:
//! - Mutexes, optionally recursive, with direct handoff to the first waiter
//! - Condition variables with an optional timeout
//! - Counting semaphores with an optional maximum
//! - Writer-preferring read/write locks
//!
//! Objects live in the kernel's [`SyncTable`] and are named by small
//! `Copy` handles. Every state change happens with preemption disabled;
//! there is a single CPU, so that is all the mutual exclusion they need.
//! Waiters are woken in FIFO order.

use alloc::collections::BTreeMap;
use bitflags::bitflags;

use crate::error::{KResult, KernelError};
use crate::kern::queue::{ChainKind, QueueHead};
use crate::kern::sched_prim::{Outcome, WaitObj, WaitResult};
use crate::scheduler::Kernel;
use crate::types::{ObjId, TaskId, Ticks};

// ============================================================================
// Object table
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MutexFlags: u32 {
        /// The owner may lock the mutex again
        const RECURSIVE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexState {
    pub owner: Option<TaskId>,
    pub lock_count: u32,
    pub flags: MutexFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemState {
    /// Negative while tasks wait: minus the number of waiters
    pub counter: i32,
    pub max: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwLockState {
    pub readers: usize,
    pub writer: Option<TaskId>,
    /// Recursion depth of the writer
    pub rec: u32,
    pub recursive: bool,
    /// Queue object waiting readers sleep on; writers use the lock's own queue
    pub readers_q: ObjId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Mutex(MutexState),
    Condvar,
    Semaphore(SemState),
    RwLock(RwLockState),
    /// Plain wait queue (task join, rwlock readers)
    Queue,
}

#[derive(Debug)]
pub struct SyncObject {
    pub state: SyncState,
    pub waiters: QueueHead,
}

/// All synchronization objects of a kernel
#[derive(Debug, Default)]
pub struct SyncTable {
    objects: BTreeMap<ObjId, SyncObject>,
    next_id: u32,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object under the next free id. Ids wrap around and
    /// skip objects still alive.
    pub fn create(&mut self, state: SyncState) -> ObjId {
        let mut id = ObjId(self.next_id);
        while self.objects.contains_key(&id) {
            id = ObjId(id.0.wrapping_add(1));
        }
        self.next_id = id.0.wrapping_add(1);
        self.objects.insert(
            id,
            SyncObject {
                state,
                waiters: QueueHead::new(ChainKind::Wait),
            },
        );
        id
    }

    pub fn remove(&mut self, id: ObjId) -> Option<SyncObject> {
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjId) -> Option<&SyncObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn expect_mut(&mut self, id: ObjId) -> &mut SyncObject {
        match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => panic!("sync: no such object {}", id),
        }
    }

    pub fn waiters_mut(&mut self, id: ObjId) -> &mut QueueHead {
        &mut self.expect_mut(id).waiters
    }

    pub fn mutex_mut(&mut self, id: ObjId) -> (&mut MutexState, &mut QueueHead) {
        let SyncObject { state, waiters } = self.expect_mut(id);
        match state {
            SyncState::Mutex(m) => (m, waiters),
            _ => panic!("sync: {} is not a mutex", id),
        }
    }

    pub fn sem_mut(&mut self, id: ObjId) -> (&mut SemState, &mut QueueHead) {
        let SyncObject { state, waiters } = self.expect_mut(id);
        match state {
            SyncState::Semaphore(s) => (s, waiters),
            _ => panic!("sync: {} is not a semaphore", id),
        }
    }

    pub fn rwlock_mut(&mut self, id: ObjId) -> (&mut RwLockState, &mut QueueHead) {
        let SyncObject { state, waiters } = self.expect_mut(id);
        match state {
            SyncState::RwLock(l) => (l, waiters),
            _ => panic!("sync: {} is not a rwlock", id),
        }
    }

    pub fn rwlock_readers_queue(&self, id: ObjId) -> ObjId {
        match self.objects.get(&id).map(|o| &o.state) {
            Some(SyncState::RwLock(l)) => l.readers_q,
            _ => panic!("sync: {} is not a rwlock", id),
        }
    }

    fn destroy(&mut self, id: ObjId, what: &str) {
        let busy = match self.objects.get(&id) {
            Some(obj) => !obj.waiters.is_empty(),
            None => panic!("{}: no such object {}", what, id),
        };
        assert!(!busy, "{}: {} still has waiters", what, id);
        self.objects.remove(&id);
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Sleeping mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMutex(ObjId);

/// Condition variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KCond(ObjId);

/// Counting semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KSem(ObjId);

/// Writer-preferring read/write lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwLockWp(ObjId);

impl KMutex {
    pub fn id(self) -> ObjId {
        self.0
    }
}

impl KCond {
    pub fn id(self) -> ObjId {
        self.0
    }
}

impl KSem {
    pub fn id(self) -> ObjId {
        self.0
    }
}

impl RwLockWp {
    pub fn id(self) -> ObjId {
        self.0
    }
}

// ============================================================================
// Mutex
// ============================================================================

impl Kernel {
    pub fn kmutex_init(&mut self, flags: MutexFlags) -> KMutex {
        KMutex(self.sync.create(SyncState::Mutex(MutexState {
            owner: None,
            lock_count: 0,
            flags,
        })))
    }

    /// Claim `m` or sleep until it is handed over
    pub fn kmutex_lock(&mut self, m: KMutex) -> Outcome<()> {
        self.disable_preemption();
        if self.mutex_try_claim(m.0) {
            self.enable_preemption();
            return Outcome::Done(());
        }
        self.sleep_on(WaitObj::Mutex(m.0), 0).map(|_| ())
    }

    pub fn kmutex_trylock(&mut self, m: KMutex) -> bool {
        self.disable_preemption();
        let ok = self.mutex_try_claim(m.0);
        self.enable_preemption();
        ok
    }

    fn mutex_try_claim(&mut self, id: ObjId) -> bool {
        let curr = self.current;
        let (st, _) = self.sync.mutex_mut(id);
        match st.owner {
            None => {
                st.owner = Some(curr);
                st.lock_count = 1;
                true
            }
            Some(owner) if owner == curr => {
                assert!(
                    st.flags.contains(MutexFlags::RECURSIVE),
                    "kmutex_lock: {} already owns non-recursive {}",
                    curr,
                    id
                );
                st.lock_count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release `m`. The last unlock hands the mutex to the first waiter.
    pub fn kmutex_unlock(&mut self, m: KMutex) {
        self.disable_preemption();
        let curr = self.current;
        let (st, _) = self.sync.mutex_mut(m.0);
        assert_eq!(st.owner, Some(curr), "kmutex_unlock: {} does not own {}", curr, m.0);

        st.lock_count -= 1;
        if st.lock_count == 0 {
            self.mutex_handoff(m.0);
        }
        self.enable_preemption();
    }

    /// Give an unlocked mutex to its first waiter, if any
    fn mutex_handoff(&mut self, id: ObjId) {
        let (st, waiters) = self.sync.mutex_mut(id);
        let next = waiters.dequeue_head(&mut self.tasks);
        st.owner = next;
        st.lock_count = u32::from(next.is_some());

        if let Some(tid) = next {
            self.wake_task(tid, WaitResult::Awakened);
        }
    }

    /// Give `id` to a woken condvar waiter, or queue it on the mutex
    pub(crate) fn mutex_reacquire(&mut self, tid: TaskId, id: ObjId, result: WaitResult) {
        let (st, _) = self.sync.mutex_mut(id);
        if st.owner.is_none() {
            st.owner = Some(tid);
            st.lock_count = 1;
            self.wake_task(tid, result);
            return;
        }

        self.sync.waiters_mut(id).enqueue_tail(&mut self.tasks, tid);
        let task = self.tasks.expect_mut(tid);
        task.wait_obj = WaitObj::Mutex(id);
        task.wait_result = Some(result);
        if let Some(key) = task.wakeup_timer.take() {
            self.timers.cancel(key);
        }
    }

    pub fn kmutex_destroy(&mut self, m: KMutex) {
        let (st, _) = self.sync.mutex_mut(m.0);
        assert!(st.owner.is_none(), "kmutex_destroy: {} is locked", m.0);
        self.sync.destroy(m.0, "kmutex_destroy");
    }

    pub fn kmutex_owner(&self, m: KMutex) -> Option<TaskId> {
        match self.sync.get(m.0).map(|o| &o.state) {
            Some(SyncState::Mutex(st)) => st.owner,
            _ => None,
        }
    }

    pub fn kmutex_is_curr_task_holding_lock(&self, m: KMutex) -> bool {
        self.kmutex_owner(m) == Some(self.current)
    }

    // ========================================================================
    // Condition variable
    // ========================================================================

    pub fn kcond_init(&mut self) -> KCond {
        KCond(self.sync.create(SyncState::Condvar))
    }

    /// Release `m` and sleep on `c`; `m` is owned again when the task
    /// resumes. The wake result reports false on timeout. A zero
    /// `timeout` waits forever.
    pub fn kcond_wait(&mut self, c: KCond, m: KMutex, timeout: Ticks) -> Outcome<bool> {
        self.disable_preemption();
        let curr = self.current;
        let (st, _) = self.sync.mutex_mut(m.0);
        assert_eq!(st.owner, Some(curr), "kcond_wait: {} does not own {}", curr, m.0);
        assert_eq!(st.lock_count, 1, "kcond_wait: {} is locked recursively", m.0);

        self.mutex_handoff(m.0);
        let wobj = WaitObj::Condvar {
            cond: c.0,
            mutex: m.0,
        };
        self.sleep_on(wobj, timeout).map(|res| !res.is_timeout())
    }

    pub fn kcond_signal_one(&mut self, c: KCond) {
        self.cond_wakeup(c, false);
    }

    pub fn kcond_signal_all(&mut self, c: KCond) {
        self.cond_wakeup(c, true);
    }

    fn cond_wakeup(&mut self, c: KCond, all: bool) {
        self.disable_preemption();
        while let Some(tid) = self.sync.waiters_mut(c.0).dequeue_head(&mut self.tasks) {
            let mutex = match self.tasks.expect(tid).wait_obj {
                WaitObj::Condvar { mutex, .. } => mutex,
                other => panic!("kcond: {} waits on {:?}", tid, other),
            };
            self.mutex_reacquire(tid, mutex, WaitResult::Awakened);
            if !all {
                break;
            }
        }
        self.enable_preemption();
    }

    pub fn kcond_destroy(&mut self, c: KCond) {
        self.sync.destroy(c.0, "kcond_destroy");
    }

    // ========================================================================
    // Semaphore
    // ========================================================================

    /// Counting semaphore starting at `value`, never above `max`
    pub fn ksem_init(&mut self, value: i32, max: Option<i32>) -> KResult<KSem> {
        if value < 0 {
            return Err(KernelError::InvalidConfig("negative semaphore value"));
        }
        if let Some(max) = max {
            if max <= 0 || value > max {
                return Err(KernelError::InvalidConfig("semaphore value above its maximum"));
            }
        }
        Ok(KSem(self.sync.create(SyncState::Semaphore(SemState { counter: value, max }))))
    }

    /// Take one unit, sleeping until one is available. The wake result
    /// reports false on timeout.
    pub fn ksem_wait(&mut self, s: KSem, timeout: Ticks) -> Outcome<bool> {
        self.disable_preemption();
        let (st, _) = self.sync.sem_mut(s.0);
        st.counter -= 1;
        if st.counter >= 0 {
            self.enable_preemption();
            return Outcome::Done(true);
        }
        self.sleep_on(WaitObj::Semaphore(s.0), timeout).map(|res| !res.is_timeout())
    }

    pub fn ksem_trywait(&mut self, s: KSem) -> bool {
        self.disable_preemption();
        let (st, _) = self.sync.sem_mut(s.0);
        let ok = st.counter > 0;
        if ok {
            st.counter -= 1;
        }
        self.enable_preemption();
        ok
    }

    /// Return one unit, waking the longest waiter if there is one
    pub fn ksem_signal(&mut self, s: KSem) -> KResult<()> {
        self.disable_preemption();
        let (st, waiters) = self.sync.sem_mut(s.0);
        if let Some(max) = st.max {
            if st.counter >= max {
                self.enable_preemption();
                return Err(KernelError::SemOverflow);
            }
        }

        st.counter += 1;
        let next = if st.counter <= 0 {
            waiters.dequeue_head(&mut self.tasks)
        } else {
            None
        };
        if let Some(tid) = next {
            self.wake_task(tid, WaitResult::Awakened);
        }
        self.enable_preemption();
        Ok(())
    }

    pub fn ksem_value(&self, s: KSem) -> i32 {
        match self.sync.get(s.0).map(|o| &o.state) {
            Some(SyncState::Semaphore(st)) => st.counter,
            _ => panic!("ksem_value: {} is not a semaphore", s.0),
        }
    }

    pub fn ksem_destroy(&mut self, s: KSem) {
        self.sync.destroy(s.0, "ksem_destroy");
    }

    // ========================================================================
    // Read/Write lock (writer preferring)
    // ========================================================================

    pub fn rwlock_init(&mut self, recursive: bool) -> RwLockWp {
        let readers_q = self.sync.create(SyncState::Queue);
        RwLockWp(self.sync.create(SyncState::RwLock(RwLockState {
            readers: 0,
            writer: None,
            rec: 0,
            recursive,
            readers_q,
        })))
    }

    /// Shared lock. New readers wait while a writer holds or waits for
    /// the lock.
    pub fn rwlock_shlock(&mut self, l: RwLockWp) -> Outcome<()> {
        self.disable_preemption();
        let (st, writers) = self.sync.rwlock_mut(l.0);
        if st.writer.is_none() && writers.is_empty() {
            st.readers += 1;
            self.enable_preemption();
            return Outcome::Done(());
        }
        let wobj = WaitObj::RwLock {
            lock: l.0,
            exclusive: false,
        };
        self.sleep_on(wobj, 0).map(|_| ())
    }

    pub fn rwlock_shunlock(&mut self, l: RwLockWp) {
        self.disable_preemption();
        let (st, _) = self.sync.rwlock_mut(l.0);
        assert!(st.readers > 0, "rwlock_shunlock: {} is not read-locked", l.0);
        st.readers -= 1;
        if st.readers == 0 {
            self.rwlock_release_waiters(l.0);
        }
        self.enable_preemption();
    }

    pub fn rwlock_exlock(&mut self, l: RwLockWp) -> Outcome<()> {
        self.disable_preemption();
        let curr = self.current;
        let (st, _) = self.sync.rwlock_mut(l.0);

        if st.writer == Some(curr) {
            assert!(st.recursive, "rwlock_exlock: {} already holds {}", curr, l.0);
            st.rec += 1;
            self.enable_preemption();
            return Outcome::Done(());
        }
        if st.writer.is_none() && st.readers == 0 {
            st.writer = Some(curr);
            st.rec = 1;
            self.enable_preemption();
            return Outcome::Done(());
        }

        let wobj = WaitObj::RwLock {
            lock: l.0,
            exclusive: true,
        };
        self.sleep_on(wobj, 0).map(|_| ())
    }

    /// Exclusive unlock: the next waiting writer goes first, otherwise
    /// every waiting reader is admitted
    pub fn rwlock_exunlock(&mut self, l: RwLockWp) {
        self.disable_preemption();
        let curr = self.current;
        let (st, _) = self.sync.rwlock_mut(l.0);
        assert_eq!(st.writer, Some(curr), "rwlock_exunlock: {} does not hold {}", curr, l.0);

        st.rec -= 1;
        if st.rec == 0 {
            st.writer = None;
            self.rwlock_release_waiters(l.0);
        }
        self.enable_preemption();
    }

    pub(crate) fn rwlock_release_waiters(&mut self, id: ObjId) {
        let (st, writers) = self.sync.rwlock_mut(id);
        if st.writer.is_some() {
            return;
        }

        if st.readers == 0 {
            if let Some(tid) = writers.dequeue_head(&mut self.tasks) {
                st.writer = Some(tid);
                st.rec = 1;
                self.wake_task(tid, WaitResult::Awakened);
                return;
            }
        } else if !writers.is_empty() {
            return;
        }

        let readers_q = st.readers_q;
        while let Some(tid) = self.sync.waiters_mut(readers_q).dequeue_head(&mut self.tasks) {
            self.sync.rwlock_mut(id).0.readers += 1;
            self.wake_task(tid, WaitResult::Awakened);
        }
    }

    pub fn rwlock_readers(&self, l: RwLockWp) -> usize {
        match self.sync.get(l.0).map(|o| &o.state) {
            Some(SyncState::RwLock(st)) => st.readers,
            _ => 0,
        }
    }

    pub fn rwlock_writer(&self, l: RwLockWp) -> Option<TaskId> {
        match self.sync.get(l.0).map(|o| &o.state) {
            Some(SyncState::RwLock(st)) => st.writer,
            _ => None,
        }
    }

    pub fn rwlock_destroy(&mut self, l: RwLockWp) {
        let (st, _) = self.sync.rwlock_mut(l.0);
        assert!(
            st.writer.is_none() && st.readers == 0,
            "rwlock_destroy: {} is locked",
            l.0
        );
        let readers_q = st.readers_q;
        self.sync.destroy(readers_q, "rwlock_destroy");
        self.sync.destroy(l.0, "rwlock_destroy");
    }
}

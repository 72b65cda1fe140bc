//! Kernel Timers - tick accounting and wakeup timers
//!
//! Sleeping tasks with a deadline (`kernel_sleep`, condvar waits with a
//! timeout) register a wakeup timer. Timers fire in deadline order;
//! timers with the same deadline fire in the order they were armed.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::{TaskId, Ticks};

// ============================================================================
// Tick accounting
// ============================================================================

/// Ticks charged to a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTicks {
    /// Ticks spent running
    pub total: Ticks,
    /// Ticks spent running as a user task
    pub user: Ticks,
    /// Ticks of the current time slot, reset when the task is picked
    pub timeslot: Ticks,
}

impl TaskTicks {
    pub const fn new() -> Self {
        Self {
            total: 0,
            user: 0,
            timeslot: 0,
        }
    }

    /// Charge one tick
    pub fn update(&mut self, user: bool) {
        self.total += 1;
        self.timeslot += 1;
        if user {
            self.user += 1;
        }
    }
}

// ============================================================================
// Timer Queue
// ============================================================================

/// Handle of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Ticks,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> Ticks {
        self.deadline
    }
}

/// Queue of pending wakeup timers
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: BTreeMap<TimerKey, TaskId>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake `task` at tick `deadline`
    pub fn schedule(&mut self, deadline: Ticks, task: TaskId) -> TimerKey {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.timers.insert(key, task);
        key
    }

    /// Cancel a timer. Returns false if it already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.timers.remove(&key).is_some()
    }

    /// Remove and return the tasks whose deadline is `now` or earlier
    pub fn process(&mut self, now: Ticks) -> Vec<TaskId> {
        let mut expired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    /// Get next deadline
    pub fn next_deadline(&self) -> Option<Ticks> {
        self.timers.keys().next().map(|k| k.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

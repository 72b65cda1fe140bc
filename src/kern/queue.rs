//! Generic Queue - Doubly-linked list of tasks
//!
//! The queue linkage is embedded in the queued objects, so removal from
//! the middle of a queue is O(1) and an object can sit on several queues
//! through different chains. Links are task ids rather than pointers: the
//! task arena owns every task, a queue only names them.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! struct Task {
//!     sched_chain: QueueChain,   // runnable / sleeping / zombie list
//!     wait_chain: QueueChain,    // wait queue of a sync object
//! }
//!
//! let mut runnable = QueueHead::new(ChainKind::Sched);
//! runnable.enqueue_tail(&mut tasks, tid);
//! ```

use crate::types::TaskId;

// ============================================================================
// Queue Entry
// ============================================================================

/// Which embedded chain of an object a queue threads through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Scheduler lists: runnable, sleeping, zombie
    Sched,
    /// Wait queue of a synchronization object
    Wait,
}

/// A queue chain entry, embedded in structures that can be queued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueChain {
    next: Option<TaskId>,
    prev: Option<TaskId>,
    linked: bool,
}

impl QueueChain {
    /// Create a new unlinked queue chain
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    /// Check if this entry is linked into a queue
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn next(&self) -> Option<TaskId> {
        self.next
    }

    pub fn prev(&self) -> Option<TaskId> {
        self.prev
    }
}

/// Storage resolving a task id to its embedded chains
pub trait QueueArena {
    fn chain(&self, id: TaskId, kind: ChainKind) -> &QueueChain;
    fn chain_mut(&mut self, id: TaskId, kind: ChainKind) -> &mut QueueChain;
}

// ============================================================================
// Queue Head
// ============================================================================

/// A queue head - represents the queue itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHead {
    first: Option<TaskId>,
    last: Option<TaskId>,
    len: usize,
    kind: ChainKind,
}

impl QueueHead {
    /// Create a new empty queue threading through `kind` chains
    pub const fn new(kind: ChainKind) -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
            kind,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<TaskId> {
        self.first
    }

    pub fn last(&self) -> Option<TaskId> {
        self.last
    }

    /// Enqueue `id` at the tail of the queue
    pub fn enqueue_tail<A: QueueArena + ?Sized>(&mut self, arena: &mut A, id: TaskId) {
        let kind = self.kind;
        let elt = arena.chain_mut(id, kind);
        assert!(!elt.linked, "queue: {} is already linked", id);
        elt.linked = true;
        elt.next = None;
        elt.prev = self.last;

        match self.last {
            Some(last) => arena.chain_mut(last, kind).next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    /// Remove and return the head of the queue
    pub fn dequeue_head<A: QueueArena + ?Sized>(&mut self, arena: &mut A) -> Option<TaskId> {
        let id = self.first?;
        self.remove(arena, id);
        Some(id)
    }

    /// Remove `id` from anywhere in the queue.
    ///
    /// `id` must be linked into this queue.
    pub fn remove<A: QueueArena + ?Sized>(&mut self, arena: &mut A, id: TaskId) {
        let kind = self.kind;
        let elt = *arena.chain(id, kind);
        assert!(elt.linked, "queue: {} is not linked", id);

        match elt.prev {
            Some(prev) => arena.chain_mut(prev, kind).next = elt.next,
            None => {
                assert_eq!(self.first, Some(id), "queue: {} is linked into another queue", id);
                self.first = elt.next;
            }
        }
        match elt.next {
            Some(next) => arena.chain_mut(next, kind).prev = elt.prev,
            None => self.last = elt.prev,
        }

        *arena.chain_mut(id, kind) = QueueChain::new();
        self.len -= 1;
    }

    /// Iterate front to back
    pub fn iter<'a, A: QueueArena + ?Sized>(&self, arena: &'a A) -> QueueIter<'a, A> {
        QueueIter {
            arena,
            kind: self.kind,
            next: self.first,
        }
    }
}

/// Iterator over a queue
pub struct QueueIter<'a, A: QueueArena + ?Sized> {
    arena: &'a A,
    kind: ChainKind,
    next: Option<TaskId>,
}

impl<A: QueueArena + ?Sized> Iterator for QueueIter<'_, A> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.next?;
        self.next = self.arena.chain(id, self.kind).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct Arena(BTreeMap<TaskId, [QueueChain; 2]>);

    impl Arena {
        fn with(ids: &[u32]) -> Self {
            let mut arena = Arena::default();
            for &id in ids {
                arena.0.insert(TaskId(id), [QueueChain::new(); 2]);
            }
            arena
        }
    }

    impl QueueArena for Arena {
        fn chain(&self, id: TaskId, kind: ChainKind) -> &QueueChain {
            &self.0[&id][kind as usize]
        }

        fn chain_mut(&mut self, id: TaskId, kind: ChainKind) -> &mut QueueChain {
            &mut self.0.get_mut(&id).unwrap()[kind as usize]
        }
    }

    fn ids(q: &QueueHead, arena: &Arena) -> Vec<u32> {
        q.iter(arena).map(|t| t.0).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut arena = Arena::with(&[1, 2, 3]);
        let mut q = QueueHead::new(ChainKind::Wait);
        assert!(q.is_empty());

        for id in 1..=3 {
            q.enqueue_tail(&mut arena, TaskId(id));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(ids(&q, &arena), [1, 2, 3]);

        assert_eq!(q.dequeue_head(&mut arena), Some(TaskId(1)));
        assert_eq!(q.dequeue_head(&mut arena), Some(TaskId(2)));
        assert_eq!(q.dequeue_head(&mut arena), Some(TaskId(3)));
        assert_eq!(q.dequeue_head(&mut arena), None);
        assert!(!arena.chain(TaskId(1), ChainKind::Wait).is_linked());
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let mut arena = Arena::with(&[1, 2, 3, 4]);
        let mut q = QueueHead::new(ChainKind::Sched);
        for id in 1..=4 {
            q.enqueue_tail(&mut arena, TaskId(id));
        }

        q.remove(&mut arena, TaskId(2));
        assert_eq!(ids(&q, &arena), [1, 3, 4]);
        q.remove(&mut arena, TaskId(4));
        assert_eq!(q.last(), Some(TaskId(3)));
        q.remove(&mut arena, TaskId(1));
        assert_eq!(q.first(), Some(TaskId(3)));
        assert_eq!(q.len(), 1);

        // removed entries can be queued again
        q.enqueue_tail(&mut arena, TaskId(2));
        assert_eq!(ids(&q, &arena), [3, 2]);
    }

    #[test]
    fn test_two_chains_are_independent() {
        let mut arena = Arena::with(&[1, 2]);
        let mut sched = QueueHead::new(ChainKind::Sched);
        let mut wait = QueueHead::new(ChainKind::Wait);

        sched.enqueue_tail(&mut arena, TaskId(1));
        sched.enqueue_tail(&mut arena, TaskId(2));
        wait.enqueue_tail(&mut arena, TaskId(2));
        wait.enqueue_tail(&mut arena, TaskId(1));

        assert_eq!(ids(&sched, &arena), [1, 2]);
        assert_eq!(ids(&wait, &arena), [2, 1]);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn test_double_enqueue_panics() {
        let mut arena = Arena::with(&[1]);
        let mut q = QueueHead::new(ChainKind::Wait);
        q.enqueue_tail(&mut arena, TaskId(1));
        q.enqueue_tail(&mut arena, TaskId(1));
    }

    #[test]
    #[should_panic(expected = "another queue")]
    fn test_remove_from_wrong_queue_panics() {
        let mut arena = Arena::with(&[1, 2]);
        let mut a = QueueHead::new(ChainKind::Wait);
        let mut b = QueueHead::new(ChainKind::Wait);
        a.enqueue_tail(&mut arena, TaskId(1));
        b.enqueue_tail(&mut arena, TaskId(2));
        b.remove(&mut arena, TaskId(1));
    }
}

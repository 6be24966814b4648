//! Scheduler queues feeding the drain.
//!
//! Three queues, owned per engine, give the drain its completion semantics:
//!
//! 1. **Cancel queue** — settled-as-canceled nodes; drained with priority
//!    before every completion and progress item.
//! 2. **Handle queue** — resolved/rejected nodes whose dependents are ready
//!    to be notified.
//! 3. **Progress queue** — listeners with a pending normalized-progress
//!    invocation; new signals go to the back, a listener re-signaled while
//!    its callback runs goes back to the front.
//!
//! ## Ordering guarantees
//!
//! - FIFO within one queue, except explicit front pushes
//! - Push side is multi-producer (any thread); the pop side is only ever
//!   called from the single draining thread
//! - Items queued during a drain are executed by the same drain

use std::collections::VecDeque;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// One cache-padded, mutex-guarded deque.
pub(crate) struct DrainQueue<T> {
    queue: CachePadded<Mutex<VecDeque<T>>>,
}

impl<T> DrainQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: CachePadded::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push_back(&self, item: T) {
        self.queue.lock().push_back(item);
    }

    pub fn push_front(&self, item: T) {
        self.queue.lock().push_front(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }
}

impl<T> Default for DrainQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = DrainQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_front_push_takes_priority() {
        let q = DrainQueue::new();
        q.push_back("b");
        q.push_front("a");
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
    }
}

//! Fast semaphores
//!
//! Symbian's light kernel semaphore: a counter with a queue of waiters.
//! An uncontended wait is a plain decrement; signal wakes waiters in real
//! priority order, FIFO within a priority. As with mutexes, the kernel
//! drives the thread-state side of wait and signal.

use super::object::ObjectInfo;
use super::thread::ThreadId;

/// Identifier into the kernel's semaphore arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(pub usize);

/// A fast semaphore.
#[derive(Debug)]
pub struct Semaphore {
    pub info: ObjectInfo,
    pub count: i32,
    /// Blocked waiters in enqueue order.
    pub waiting: Vec<ThreadId>,
    /// Waiters suspended while blocked.
    pub suspended: Vec<ThreadId>,
}

impl Semaphore {
    pub fn new(info: ObjectInfo, initial: i32) -> Self {
        Self {
            info,
            count: initial,
            waiting: Vec::new(),
            suspended: Vec::new(),
        }
    }

    /// Pick (and remove) the highest-real-priority waiter; FIFO on ties.
    pub fn take_best_waiter<F>(&mut self, priority_of: F) -> Option<ThreadId>
    where
        F: Fn(ThreadId) -> i32,
    {
        let mut best: Option<(usize, i32)> = None;
        for (pos, &tid) in self.waiting.iter().enumerate() {
            let pri = priority_of(tid);
            if best.map(|(_, bp)| pri > bp).unwrap_or(true) {
                best = Some((pos, pri));
            }
        }
        best.map(|(pos, _)| self.waiting.remove(pos))
    }

    pub fn remove_waiter(&mut self, thread: ThreadId) -> bool {
        let before = self.waiting.len() + self.suspended.len();
        self.waiting.retain(|&t| t != thread);
        self.suspended.retain(|&t| t != thread);
        before != self.waiting.len() + self.suspended.len()
    }
}

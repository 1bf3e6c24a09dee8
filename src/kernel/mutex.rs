//! Mutexes
//!
//! Recursive, ownership-aware mutexes with priority inheritance. The
//! waiter queue is kept as a plain list; the winner is picked at signal
//! time by highest real priority, ties going to the earliest-enqueued
//! waiter. The acquire/release choreography (state changes, scheduler
//! hand-off, inheritance recompute) is driven by the kernel.

use super::object::ObjectInfo;
use super::thread::ThreadId;

/// Identifier into the kernel's mutex arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub usize);

/// A recursive kernel mutex.
#[derive(Debug)]
pub struct Mutex {
    pub info: ObjectInfo,
    pub holder: Option<ThreadId>,
    /// Recursive acquisitions by the holder.
    pub hold_count: u32,
    /// Blocked waiters in enqueue order.
    pub waiting: Vec<ThreadId>,
    /// Waiters that were suspended while blocked.
    pub suspended: Vec<ThreadId>,
    /// Threads granted ownership but not yet scheduled.
    pub pending: Vec<ThreadId>,
}

impl Mutex {
    pub fn new(info: ObjectInfo) -> Self {
        Self {
            info,
            holder: None,
            hold_count: 0,
            waiting: Vec::new(),
            suspended: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }

    pub fn held_by(&self, thread: ThreadId) -> bool {
        self.holder == Some(thread)
    }

    /// Pick (and remove) the waiter with the highest real priority;
    /// enqueue order breaks ties. `priority_of` reads the thread arena.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::object::{Access, ObjectInfo, OwnerKind};

    fn mutex() -> Mutex {
        Mutex::new(ObjectInfo::new(
            1,
            Some("lock".into()),
            OwnerKind::Process,
            Access::Global,
        ))
    }

    #[test]
    fn test_best_waiter_by_priority() {
        let mut m = mutex();
        m.waiting = vec![ThreadId(0), ThreadId(1), ThreadId(2)];

        let pri = |t: ThreadId| match t.0 {
            1 => 20,
            _ => 0,
        };

        assert_eq!(m.take_best_waiter(pri), Some(ThreadId(1)));
        assert_eq!(m.waiting, vec![ThreadId(0), ThreadId(2)]);
    }

    #[test]
    fn test_best_waiter_fifo_on_tie() {
        let mut m = mutex();
        m.waiting = vec![ThreadId(5), ThreadId(6)];
        assert_eq!(m.take_best_waiter(|_| 0), Some(ThreadId(5)));
    }

    #[test]
    fn test_remove_waiter() {
        let mut m = mutex();
        m.waiting = vec![ThreadId(1)];
        m.suspended = vec![ThreadId(2)];

        assert!(m.remove_waiter(ThreadId(2)));
        assert!(!m.remove_waiter(ThreadId(2)));
        assert!(m.remove_waiter(ThreadId(1)));
    }
}

//! Virtual timing
//!
//! A monotonic virtual clock in microseconds plus a timed-event queue.
//! Nothing here touches host time: the system loop advances the clock by
//! executed timeslices, or jumps it to the next deadline when no thread is
//! runnable (idle advance).
//!
//! Design:
//! - Event types are registered by name; consumers keep the returned id
//! - Events carry a plain `userdata` word, no callbacks, so firing them
//!   is a pure data hand-off to the kernel
//! - Events fire in nondecreasing deadline order; equal deadlines fire in
//!   insertion order

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Registered event-type identifier.
pub type EventType = usize;

/// A pending timed event.
#[derive(Debug, Clone)]
struct Event {
    deadline: u64,
    event_type: EventType,
    userdata: u64,
}

/// An event that reached its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub event_type: EventType,
    pub userdata: u64,
    /// How far past the deadline the clock was when the event fired.
    pub late_us: u64,
}

/// Heap entry; the sequence number breaks deadline ties in insertion order.
#[derive(Debug)]
struct QueueEntry {
    deadline: u64,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; earlier seq wins on equal deadlines.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The virtual clock and its event queue.
pub struct Timing {
    now_us: u64,
    event_types: Vec<String>,
    pending: HashMap<u64, Event>,
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl Timing {
    pub fn new() -> Self {
        Self {
            now_us: 0,
            event_types: Vec::new(),
            pending: HashMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Current virtual time in microseconds.
    pub fn ticks(&self) -> u64 {
        self.now_us
    }

    /// Register an event type, or return the existing id for `name`.
    pub fn register_event(&mut self, name: &str) -> EventType {
        if let Some(pos) = self.event_types.iter().position(|n| n == name) {
            return pos;
        }
        self.event_types.push(name.to_string());
        self.event_types.len() - 1
    }

    /// Schedule `event_type` to fire `delay_us` from now.
    pub fn schedule_event(&mut self, delay_us: u64, event_type: EventType, userdata: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let deadline = self.now_us + delay_us;
        self.pending.insert(
            seq,
            Event {
                deadline,
                event_type,
                userdata,
            },
        );
        self.queue.push(QueueEntry { deadline, seq });
    }

    /// Remove every pending event matching `(event_type, userdata)`.
    /// Returns true if anything was removed.
    pub fn unschedule_event(&mut self, event_type: EventType, userdata: u64) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|_, ev| !(ev.event_type == event_type && ev.userdata == userdata));
        before != self.pending.len()
    }

    /// Move the clock forward.
    pub fn add_ticks(&mut self, us: u64) {
        self.now_us += us;
    }

    /// Jump the clock to the earliest pending deadline, if any is later
    /// than now. Used when no thread is runnable.
    pub fn idle(&mut self) {
        if let Some(deadline) = self.next_deadline() {
            if deadline > self.now_us {
                self.now_us = deadline;
            }
        }
    }

    /// Fire every event whose deadline has passed, in order.
    pub fn advance(&mut self) -> Vec<FiredEvent> {
        let mut fired = Vec::new();

        while let Some(entry) = self.queue.peek() {
            if entry.deadline > self.now_us {
                break;
            }

            let entry = self.queue.pop().expect("peeked entry");

            // Unscheduled events stay in the heap until their slot drains.
            if let Some(ev) = self.pending.remove(&entry.seq) {
                fired.push(FiredEvent {
                    event_type: ev.event_type,
                    userdata: ev.userdata,
                    late_us: self.now_us - ev.deadline,
                });
            }
        }

        fired
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().map(|ev| ev.deadline).min()
    }

    /// Number of events still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_event_idempotent() {
        let mut timing = Timing::new();
        let a = timing.register_event("SleepTimeout");
        let b = timing.register_event("AfterTimeout");
        assert_ne!(a, b);
        assert_eq!(timing.register_event("SleepTimeout"), a);
    }

    #[test]
    fn test_events_fire_in_deadline_order() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        timing.schedule_event(300, evt, 3);
        timing.schedule_event(100, evt, 1);
        timing.schedule_event(200, evt, 2);

        timing.add_ticks(300);
        let fired: Vec<u64> = timing.advance().iter().map(|f| f.userdata).collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        for data in [10, 20, 30] {
            timing.schedule_event(50, evt, data);
        }

        timing.add_ticks(50);
        let fired: Vec<u64> = timing.advance().iter().map(|f| f.userdata).collect();
        assert_eq!(fired, vec![10, 20, 30]);
    }

    #[test]
    fn test_not_due_yet() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        timing.schedule_event(100, evt, 1);
        timing.add_ticks(99);
        assert!(timing.advance().is_empty());

        timing.add_ticks(1);
        assert_eq!(timing.advance().len(), 1);
    }

    #[test]
    fn test_unschedule() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        timing.schedule_event(100, evt, 7);
        assert!(timing.unschedule_event(evt, 7));
        assert!(!timing.unschedule_event(evt, 7));

        timing.add_ticks(200);
        assert!(timing.advance().is_empty());
    }

    #[test]
    fn test_idle_jumps_to_next_deadline() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        timing.schedule_event(5000, evt, 1);
        timing.idle();
        assert_eq!(timing.ticks(), 5000);
        assert_eq!(timing.advance().len(), 1);

        // Idle with nothing pending leaves the clock alone.
        timing.idle();
        assert_eq!(timing.ticks(), 5000);
    }

    #[test]
    fn test_late_us() {
        let mut timing = Timing::new();
        let evt = timing.register_event("test");

        timing.schedule_event(100, evt, 1);
        timing.add_ticks(150);
        let fired = timing.advance();
        assert_eq!(fired[0].late_us, 50);
    }
}

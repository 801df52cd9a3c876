// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One-shot timer scheduling for the fork event loop.
//!
//! All fork timers fire on the single serialized dispatch loop: the driver
//! sleeps until [`TimerQueue::next_deadline`] and feeds the expired payloads
//! back through the same channel as every other event. Tests drive
//! [`TimerQueue::pop_due`] with explicit instants, so timer behavior is fully
//! deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::context::ContextId;

/// Handle to a scheduled timer, used for explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

/// Ordered one-shot timer queue with lazy cancellation.
///
/// Cancelled entries stay in the heap but are skipped when popped; the
/// payload map is the source of truth for liveness.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `payload` to fire at `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, payload);
        TimerHandle(id)
    }

    /// Schedules `payload` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, payload: T) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, payload)
    }

    /// Cancels a scheduled timer. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: &TimerHandle) -> bool {
        self.entries.remove(&handle.0).is_some()
    }

    /// Returns the earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every payload whose deadline is at or before `now`, in firing
    /// order. Cancelled entries are skipped.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(payload) = self.entries.remove(&id) {
                due.push(payload);
            }
        }
        due
    }

    /// Number of live (not yet fired, not cancelled) timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no live timers remain.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which fork timer fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Late-forking deadline (`delivery-timeout`).
    Late,
    /// Urgent-response buffer (`urgent-timeout`).
    Urgent,
    /// Wait for a response after a push notification (`push-response-timeout`).
    PushWait { uid: SmolStr },
    /// Zero-delay destruction tick armed by `set_finished`.
    Finish,
}

/// Timer expiry routed back to the owning fork context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub context: ContextId,
    pub kind: TimerKind,
}

/// Shared timer wheel for every fork context managed by one router.
///
/// The queue sits behind a mutex so contexts can arm timers from inside
/// dispatch while the driver polls deadlines; all callbacks still execute on
/// the loop, never under the lock.
#[derive(Debug, Default)]
pub struct ForkScheduler {
    queue: Mutex<TimerQueue<TimerEvent>>,
}

impl ForkScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot timer for the given context.
    pub fn schedule(&self, delay: Duration, context: ContextId, kind: TimerKind) -> TimerHandle {
        self.queue.lock().schedule(delay, TimerEvent { context, kind })
    }

    /// Cancels a previously armed timer.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        self.queue.lock().cancel(handle)
    }

    /// Earliest live deadline across all contexts.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().next_deadline()
    }

    /// Drains every expiry due at `now`.
    pub fn pop_due(&self, now: Instant) -> Vec<TimerEvent> {
        self.queue.lock().pop_due(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        queue.schedule_at(base + Duration::from_secs(2), "second");
        queue.schedule_at(base + Duration::from_secs(1), "first");

        let due = queue.pop_due(base + Duration::from_secs(3));
        assert_eq!(due, vec!["first", "second"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn respects_now_cutoff() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        queue.schedule_at(base + Duration::from_secs(1), "early");
        queue.schedule_at(base + Duration::from_secs(10), "late");

        assert_eq!(queue.pop_due(base + Duration::from_secs(5)), vec!["early"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.next_deadline(),
            Some(base + Duration::from_secs(10))
        );
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        let keep = queue.schedule_at(base + Duration::from_secs(1), "keep");
        let drop = queue.schedule_at(base + Duration::from_secs(1), "drop");

        assert!(queue.cancel(&drop));
        assert!(!queue.cancel(&drop));
        let _ = keep;

        assert_eq!(queue.pop_due(base + Duration::from_secs(2)), vec!["keep"]);
    }

    #[test]
    fn cancelled_head_does_not_mask_deadline() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        let head = queue.schedule_at(base + Duration::from_secs(1), "head");
        queue.schedule_at(base + Duration::from_secs(5), "tail");

        queue.cancel(&head);
        assert_eq!(queue.next_deadline(), Some(base + Duration::from_secs(5)));
    }

    #[test]
    fn zero_delay_fires_on_next_tick() {
        let mut queue = TimerQueue::new();
        queue.schedule(Duration::ZERO, "now");
        assert_eq!(queue.pop_due(Instant::now()), vec!["now"]);
    }
}

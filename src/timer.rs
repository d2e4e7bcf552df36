//! One-shot timers for the pool loop.
//!
//! A single min-heap serves the three timer kinds the pool needs:
//! subscription timeouts, keep-alive timeouts, and backoff delays. Each
//! (slot, kind) pair holds at most one live timer; re-arming bumps a
//! generation counter so entries already in the heap become stale instead of
//! requiring heap surgery.

use crate::types::{SlotId, Time};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// What a timer means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Response entity was delivered but not yet subscribed.
    SubscriptionTimeout,
    /// Slot has been idle with an open connection.
    KeepAlive,
    /// Failed slot waiting out its backoff delay.
    Backoff,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Time,
    slot: SlotId,
    kind: TimerKind,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of one-shot timers with generation-based cancellation.
#[derive(Debug, Default)]
pub struct TimerService {
    heap: BinaryHeap<TimerEntry>,
    live: HashMap<(SlotId, TimerKind), u64>,
    next_generation: u64,
}

impl TimerService {
    /// Creates an empty timer service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer for `(slot, kind)` at `deadline`.
    pub fn arm(&mut self, slot: SlotId, kind: TimerKind, deadline: Time) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert((slot, kind), generation);
        self.heap.push(TimerEntry {
            deadline,
            slot,
            kind,
            generation,
        });
    }

    /// Cancels the live timer for `(slot, kind)`, if any.
    pub fn cancel(&mut self, slot: SlotId, kind: TimerKind) {
        self.live.remove(&(slot, kind));
    }

    /// True if `(slot, kind)` currently has a live timer.
    #[must_use]
    pub fn is_armed(&self, slot: SlotId, kind: TimerKind) -> bool {
        self.live.contains_key(&(slot, kind))
    }

    /// Earliest live deadline, if any. Stale heap entries are pruned.
    pub fn next_deadline(&mut self) -> Option<Time> {
        while let Some(entry) = self.heap.peek() {
            if self.live.get(&(entry.slot, entry.kind)) == Some(&entry.generation) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops all live timers with `deadline <= now`.
    pub fn pop_expired(&mut self, now: Time) -> Vec<(SlotId, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            let key = (entry.slot, entry.kind);
            if self.live.get(&key) == Some(&entry.generation) {
                self.live.remove(&key);
                fired.push(key);
            }
        }
        fired
    }

    /// Drops all timers.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

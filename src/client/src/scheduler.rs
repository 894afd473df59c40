// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub(crate) type TimerId = u64;

/// What to do when a deadline fires. Timers carry enough routing information
/// for the engine to act without a callback indirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// A submitted operation's deadline.
    OpDeadline { token: usize, opaque: u32 },
    /// Retry the connect to a dead node after its backoff interval.
    Reconnect { server: usize },
    /// The per-host bootstrap attempt deadline.
    BootstrapNode,
    /// The overall bootstrap deadline.
    BootstrapTotal,
    /// Retry a failed (non-initial) configuration refresh.
    BootstrapRetry,
    /// Close the streaming configuration socket after its idle window.
    HtconfigIdle { token: usize },
    /// Re-poll an unsatisfied durability requirement.
    DurabilityPoll { id: usize },
    /// Fail an unsatisfied durability requirement.
    DurabilityDeadline { id: usize },
    /// An HTTP request's deadline.
    HttpDeadline { id: usize },
}

/// A deadline heap with synchronous cancellation. Cancelled entries are
/// dropped lazily when they reach the head of the heap; once `cancel`
/// returns, the entry can no longer fire.
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerKind>,
    next_id: TimerId,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, kind);
        self.heap.push(Reverse((at, id)));
        id
    }

    pub fn schedule_after(&mut self, now: Instant, after: Duration, kind: TimerKind) -> TimerId {
        self.schedule(now + after, kind)
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<TimerKind> {
        self.entries.remove(&id)
    }

    /// The earliest live deadline. Prunes cancelled entries off the head.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one expired timer, skipping cancelled entries.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerKind)> {
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                return None;
            }
            self.heap.pop();
            if let Some(kind) = self.entries.remove(&id) {
                return Some((id, kind));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test::ManualClock;
    use crate::clock::Clock;

    #[test]
    fn fire_order() {
        let mut timers = Timers::new();
        let clock = ManualClock::new();
        let base = clock.now();

        timers.schedule(base + Duration::from_millis(20), TimerKind::BootstrapTotal);
        timers.schedule(base + Duration::from_millis(10), TimerKind::BootstrapNode);

        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(10)));

        clock.advance(Duration::from_millis(15));
        let (_, kind) = timers.pop_expired(clock.now()).expect("nothing expired");
        assert_eq!(kind, TimerKind::BootstrapNode);
        assert!(timers.pop_expired(clock.now()).is_none());

        clock.advance(Duration::from_millis(10));
        let (_, kind) = timers.pop_expired(clock.now()).expect("nothing expired");
        assert_eq!(kind, TimerKind::BootstrapTotal);
    }

    #[test]
    fn cancel_is_synchronous() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let id = timers.schedule(base, TimerKind::BootstrapNode);
        assert_eq!(timers.cancel(id), Some(TimerKind::BootstrapNode));

        // already expired by time, but cancelled entries never fire
        assert!(timers.pop_expired(base + Duration::from_secs(1)).is_none());
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_mid_heap() {
        let mut timers = Timers::new();
        let base = Instant::now();

        let first = timers.schedule(base + Duration::from_millis(1), TimerKind::BootstrapNode);
        timers.schedule(base + Duration::from_millis(2), TimerKind::BootstrapTotal);
        timers.cancel(first);

        // the cancelled head is pruned, the live entry survives
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(2)));
        let (_, kind) = timers
            .pop_expired(base + Duration::from_millis(5))
            .expect("nothing expired");
        assert_eq!(kind, TimerKind::BootstrapTotal);
    }
}

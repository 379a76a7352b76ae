// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::task::Waker;
use std::time::{Duration, Instant};

/// Identifies a single registered timer.
///
/// Ordering is by deadline first, so the queue iterates timers in firing
/// order. The sequence number distinguishes timers that share a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    pub(crate) const fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// One-shot timers ordered by deadline.
///
/// A fired timer is removed from the queue; unregistering it afterwards is a
/// no-op.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerId, Waker>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn register(&mut self, deadline: Instant, waker: Waker) -> TimerId {
        self.next_seq = self.next_seq.wrapping_add(1);
        let id = TimerId {
            deadline,
            seq: self.next_seq,
        };
        self.entries.insert(id, waker);
        id
    }

    pub fn unregister(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// Removes every timer whose deadline has passed and returns its waker.
    ///
    /// The wakers are returned instead of woken in place so the caller can
    /// release its lock before waking.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Waker> {
        // split_off keeps keys >= the split point, so nudge the split point
        // just past `now` to also collect timers due exactly at `now`.
        let split_at = now
            .checked_add(Duration::from_nanos(1))
            .unwrap_or(now);
        let pending = self.entries.split_off(&TimerId {
            deadline: split_at,
            seq: 0,
        });
        let ready = std::mem::replace(&mut self.entries, pending);
        ready.into_values().collect()
    }

    /// The deadline of the timer that fires next, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(TimerId::deadline)
    }
}

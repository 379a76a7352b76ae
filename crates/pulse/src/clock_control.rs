// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::clock::{Clock, ERR_POISONED_LOCK};
use crate::{TimerId, TimerQueue};

/// Manual control over the flow of time.
///
/// Create a control, turn it into one or more clocks with
/// [`to_clock`][ClockControl::to_clock], and move time forward with
/// [`advance`][ClockControl::advance]. Advancing past a timer's deadline
/// wakes the task awaiting it.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pulse::ClockControl;
///
/// let control = ClockControl::new();
/// let clock = control.to_clock();
///
/// let before = clock.now();
/// control.advance(Duration::from_millis(250));
/// assert_eq!(clock.now() - before, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClockControl {
    state: Arc<Mutex<ControlState>>,
}

#[derive(Debug)]
struct ControlState {
    anchor: Instant,
    offset: Duration,
    timers: TimerQueue,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            anchor: Instant::now(),
            offset: Duration::ZERO,
            timers: TimerQueue::default(),
        }
    }
}

impl ClockControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock driven by this control. All clocks created from the
    /// same control share the same virtual time.
    #[must_use]
    pub fn to_clock(&self) -> Clock {
        Clock::from_control(self.clone())
    }

    /// Moves virtual time forward and wakes every timer whose deadline was
    /// reached.
    ///
    /// Wakers are invoked after the internal lock is released, so a woken
    /// task may immediately re-register a timer.
    pub fn advance(&self, duration: Duration) {
        let ready = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            state.offset = state.offset.saturating_add(duration);
            let now = state.anchor + state.offset;
            state.timers.take_ready(now)
        };

        for waker in ready {
            waker.wake();
        }
    }

    /// Number of timers currently registered.
    #[must_use]
    pub fn timers_len(&self) -> usize {
        self.state.lock().expect(ERR_POISONED_LOCK).timers.len()
    }

    pub(crate) fn now(&self) -> Instant {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);
        state.anchor + state.offset
    }

    pub(crate) fn register_timer(&self, deadline: Instant, waker: Waker) -> TimerId {
        self.state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .timers
            .register(deadline, waker)
    }

    pub(crate) fn unregister_timer(&self, id: TimerId) {
        self.state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .timers
            .unregister(id);
    }
}

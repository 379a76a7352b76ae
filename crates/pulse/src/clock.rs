// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
#[cfg(any(feature = "tokio", test))]
use std::sync::Mutex;
#[cfg(any(feature = "tokio", test))]
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::TimerId;
#[cfg(any(feature = "tokio", test))]
use crate::TimerQueue;
use crate::clock_control::ClockControl;
use crate::delay::Delay;

pub(crate) const ERR_POISONED_LOCK: &str = "timer lock poisoned";

/// Retrieves the current instant and schedules timers.
///
/// A clock comes in two flavors:
///
/// - [`Clock::new_tokio`] (requires the `tokio` feature): real time; a
///   background task wakes registered timers with millisecond resolution.
/// - A clock obtained from [`ClockControl::to_clock`]: virtual time that only
///   moves when the test calls [`ClockControl::advance`].
///
/// Cloning a clock is cheap and every clone shares the same flow of time.
#[derive(Debug, Clone)]
pub struct Clock(Arc<ClockInner>);

impl Clock {
    /// Creates a clock whose timers are driven by the tokio runtime.
    ///
    /// Must be called from within a tokio runtime. The driver task exits
    /// once the last clone of the clock is dropped and no timers remain.
    #[cfg(any(feature = "tokio", test))]
    #[must_use]
    pub fn new_tokio() -> Self {
        Self::new_tokio_inner().0
    }

    #[cfg(any(feature = "tokio", test))]
    fn new_tokio_inner() -> (Self, tokio::task::JoinHandle<()>) {
        const RESOLUTION: Duration = Duration::from_millis(1);

        let timers = Arc::new(Mutex::new(TimerQueue::default()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let driver_timers = Arc::clone(&timers);
        let driver_cancelled = Arc::clone(&cancelled);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RESOLUTION).await;

                let ready = driver_timers
                    .lock()
                    .expect(ERR_POISONED_LOCK)
                    .take_ready(Instant::now());
                for waker in ready {
                    waker.wake();
                }

                let drained = driver_timers
                    .lock()
                    .expect(ERR_POISONED_LOCK)
                    .next_deadline()
                    .is_none();
                if drained && driver_cancelled.load(Ordering::Relaxed) {
                    break;
                }
            }
        });

        let clock = Self(Arc::new(ClockInner::System(SystemClock {
            timers,
            cancelled,
        })));
        (clock, handle)
    }

    /// Creates a clock whose time never moves on its own.
    ///
    /// Intended for tests that do not exercise timers, or that only care
    /// about `now()` being stable.
    #[must_use]
    pub fn new_frozen() -> Self {
        ClockControl::new().to_clock()
    }

    pub(crate) fn from_control(control: ClockControl) -> Self {
        Self(Arc::new(ClockInner::Control(control)))
    }

    /// The current instant according to this clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        match &*self.0 {
            #[cfg(any(feature = "tokio", test))]
            ClockInner::System(_) => Instant::now(),
            ClockInner::Control(control) => control.now(),
        }
    }

    /// Creates a [`Delay`] that completes after `duration` has elapsed on
    /// this clock.
    #[must_use]
    pub fn delay(&self, duration: Duration) -> Delay {
        Delay::new(self, duration)
    }

    pub(crate) fn register_timer(&self, deadline: Instant, waker: Waker) -> TimerId {
        match &*self.0 {
            #[cfg(any(feature = "tokio", test))]
            ClockInner::System(system) => system
                .timers
                .lock()
                .expect(ERR_POISONED_LOCK)
                .register(deadline, waker),
            ClockInner::Control(control) => control.register_timer(deadline, waker),
        }
    }

    pub(crate) fn unregister_timer(&self, id: TimerId) {
        match &*self.0 {
            #[cfg(any(feature = "tokio", test))]
            ClockInner::System(system) => system
                .timers
                .lock()
                .expect(ERR_POISONED_LOCK)
                .unregister(id),
            ClockInner::Control(control) => control.unregister_timer(id),
        }
    }

    #[cfg(test)]
    pub(crate) fn timers_len(&self) -> usize {
        match &*self.0 {
            ClockInner::System(system) => {
                system.timers.lock().expect(ERR_POISONED_LOCK).len()
            }
            ClockInner::Control(control) => control.timers_len(),
        }
    }
}

#[derive(Debug)]
enum ClockInner {
    #[cfg(any(feature = "tokio", test))]
    System(SystemClock),
    Control(ClockControl),
}

#[cfg(any(feature = "tokio", test))]
#[derive(Debug)]
struct SystemClock {
    timers: Arc<Mutex<TimerQueue>>,
    cancelled: Arc<AtomicBool>,
}

impl Drop for ClockInner {
    fn drop(&mut self) {
        match self {
            #[cfg(any(feature = "tokio", test))]
            Self::System(system) => system.cancelled.store(true, Ordering::Relaxed),
            Self::Control(_) => {}
        }
    }
}

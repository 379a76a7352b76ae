// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::TimerId;
use crate::clock::Clock;

/// A one-shot future that completes once its deadline passes.
///
/// The timer is registered lazily on first poll and unregistered when the
/// delay completes or is dropped, so dropping a pending delay cancels it and
/// releases its slot in the timer queue.
///
/// A delay of [`Duration::ZERO`] completes immediately; a delay of
/// [`Duration::MAX`] never completes.
#[derive(Debug)]
pub struct Delay {
    clock: Clock,
    duration: Duration,
    timer: Option<TimerId>,
}

impl Delay {
    /// Creates a delay that completes after `duration` has elapsed on
    /// `clock`.
    ///
    /// > **Note**: [`Clock::delay`] is a shortcut for this constructor.
    #[must_use]
    pub fn new(clock: &Clock, duration: Duration) -> Self {
        Self {
            clock: clock.clone(),
            duration,
            timer: None,
        }
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.timer {
            None if this.duration == Duration::MAX => Poll::Pending,
            None if this.duration == Duration::ZERO => Poll::Ready(()),
            None => {
                match this.clock.now().checked_add(this.duration) {
                    Some(deadline) => {
                        this.timer =
                            Some(this.clock.register_timer(deadline, cx.waker().clone()));
                    }
                    None => {
                        // Past the maximum representable instant; never fires.
                        this.duration = Duration::MAX;
                    }
                }
                Poll::Pending
            }
            Some(id) if id.deadline() <= this.clock.now() => {
                this.timer = None;
                // The timer may still be queued if this poll was not caused
                // by it firing.
                this.clock.unregister_timer(id);
                Poll::Ready(())
            }
            Some(_) => Poll::Pending,
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(id) = self.timer {
            self.clock.unregister_timer(id);
        }
    }
}

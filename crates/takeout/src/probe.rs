// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recovery probing for taken-out endpoints.
//!
//! While an endpoint is marked TKO, the responsible destination runs a probe
//! loop: wait, send one synthetic `version` request, classify the reply,
//! repeat. The wait grows exponentially up to a configured ceiling and every
//! wait is stretched by a random jitter factor so probe schedules across
//! workers stay decorrelated.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pulse::{Clock, Delay};

use crate::destination::Destination;
use crate::rnd::Rnd;

const PROBE_JITTER_MIN: f64 = 0.05;
const PROBE_JITTER_MAX: f64 = 0.50;

/// The probe delay schedule, in whole milliseconds.
///
/// `next_delay_ms` returns the delay to use now and advances the schedule:
/// sub-2 values are lifted to 2 (integer growth by 1.5 would stall at 1),
/// everything else grows by 1.5 with truncation, capped at `max_ms`. With
/// `initial = 1, max = 10` the emitted sequence is `1, 2, 3, 4, 6, 9, 10,
/// 10, …`.
#[derive(Debug)]
struct ProbeBackoff {
    initial_ms: u64,
    max_ms: u64,
    next_ms: u64,
}

impl ProbeBackoff {
    fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            next_ms: initial_ms,
        }
    }

    fn reset(&mut self) {
        self.next_ms = self.initial_ms;
    }

    fn next_delay_ms(&mut self) -> u64 {
        let current = self.next_ms;
        if self.next_ms < 2 {
            self.next_ms = 2;
        } else {
            self.next_ms = self.next_ms.saturating_mul(3) / 2;
        }
        if self.next_ms > self.max_ms {
            self.next_ms = self.max_ms;
        }
        current
    }
}

/// Stretches a delay by a uniform factor in `[1.05, 1.50]`.
fn jittered(delay_ms: u64, rnd: &Rnd) -> Duration {
    let pct = (PROBE_JITTER_MAX - PROBE_JITTER_MIN).mul_add(rnd.next_f64(), PROBE_JITTER_MIN);
    let micros = (delay_ms as f64) * 1000.0 * (1.0 + pct);
    Duration::from_micros(micros as u64)
}

/// Drives the probe loop for one destination.
///
/// At most one loop task exists at a time, and because the task awaits each
/// probe before sleeping again, at most one probe is in flight and at most
/// one delay is pending.
#[derive(Debug)]
pub(crate) struct ProbeScheduler {
    clock: Clock,
    rnd: Rnd,
    backoff: Mutex<ProbeBackoff>,
    sending: AtomicBool,
    probes_sent: AtomicU64,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProbeScheduler {
    pub fn new(clock: Clock, initial_ms: u64, max_ms: u64) -> Self {
        Self {
            clock,
            rnd: Rnd::default(),
            backoff: Mutex::new(ProbeBackoff::new(initial_ms, max_ms)),
            sending: AtomicBool::new(false),
            probes_sent: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn sending_probes(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    /// Begins a probe episode for `destination`.
    ///
    /// Must not be called while an episode is already running; the caller
    /// gates on [`sending_probes`][Self::sending_probes].
    pub fn start(&self, destination: Weak<Destination>) {
        debug_assert!(!self.sending_probes());

        self.sending.store(true, Ordering::Release);
        self.backoff.lock().reset();

        let task = tokio::spawn(probe_loop(destination));
        if let Some(stale) = self.task.lock().replace(task) {
            stale.abort();
        }
    }

    /// Ends the probe episode: clears the flag, zeroes the probe counter and
    /// cancels the pending delay by aborting the loop task.
    pub fn stop(&self) {
        self.probes_sent.store(0, Ordering::Relaxed);
        self.sending.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// The next wait of the schedule, jitter applied.
    pub fn next_probe_delay(&self) -> Delay {
        let delay = jittered(self.backoff.lock().next_delay_ms(), &self.rnd);
        self.clock.delay(delay)
    }

    pub fn record_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// The probe episode task. Holds only a weak handle so a destination that is
/// dropped mid-episode simply ends the loop on the next upgrade attempt.
async fn probe_loop(destination: Weak<Destination>) {
    loop {
        let delay = {
            let Some(dest) = destination.upgrade() else {
                return;
            };
            if !dest.sending_probes() {
                return;
            }
            dest.next_probe_delay()
        };
        delay.await;

        let Some(dest) = destination.upgrade() else {
            return;
        };
        if !dest.sending_probes() {
            return;
        }
        dest.send_probe().await;
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared per-endpoint failure accounting.
//!
//! Every destination pointing at the same endpoint feeds its observed
//! failures into one [`FailureCounter`]. When a threshold is crossed the
//! counter elects exactly one *responsible* destination; only that
//! destination runs the probe loop, so a recovering server is never hit by
//! one probe loop per router worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::destination::Destination;

/// Endpoint classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TkoClass {
    Healthy = 0,
    Soft = 1,
    Hard = 2,
}

impl TkoClass {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Soft,
            _ => Self::Hard,
        }
    }
}

/// Process-wide totals of endpoints currently taken out, shared by every
/// failure counter that was created with the same instance.
#[derive(Debug, Default)]
pub struct TkoGauges {
    hard: AtomicU64,
    soft: AtomicU64,
}

impl TkoGauges {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn snapshot(&self) -> GlobalTkos {
        GlobalTkos {
            hard_tkos: self.hard.load(Ordering::Relaxed),
            soft_tkos: self.soft.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time totals of taken-out endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalTkos {
    pub hard_tkos: u64,
    pub soft_tkos: u64,
}

/// State shared by every destination that points at one endpoint.
#[derive(Debug)]
pub struct SharedEndpointState {
    key: String,
    tko: FailureCounter,
}

impl SharedEndpointState {
    /// `key` identifies the endpoint in logs. Thresholds of zero disable the
    /// corresponding TKO class.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        hard_threshold: u32,
        soft_threshold: u32,
        gauges: Arc<TkoGauges>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            tko: FailureCounter {
                classification: AtomicU8::new(TkoClass::Healthy as u8),
                hard_threshold,
                soft_threshold,
                gauges,
                inner: Mutex::new(CounterInner::default()),
            },
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn tko(&self) -> &FailureCounter {
        &self.tko
    }
}

/// Failure counts and TKO classification for one endpoint.
///
/// Readers (`is_tko` and friends) are lock-free; a slightly stale answer is
/// acceptable because a request admitted a moment before the mark is
/// harmless. Mutations take a single mutex, and the classification word is
/// only ever written while that mutex is held, which linearises the
/// responsible-destination election: the first recorder to cross a threshold
/// under the lock wins, later recorders observe a non-healthy classification
/// and lose.
#[derive(Debug)]
pub struct FailureCounter {
    classification: AtomicU8,
    hard_threshold: u32,
    soft_threshold: u32,
    gauges: Arc<TkoGauges>,
    inner: Mutex<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    hard_failures: u32,
    soft_failures: u32,
    /// The destination that tripped the current TKO. Non-owning: the probe
    /// loop, not this pointer, keeps the destination alive.
    responsible: Option<Weak<Destination>>,
    members: HashMap<usize, MemberState>,
}

#[derive(Debug, Default)]
struct MemberState {
    consecutive_soft: u32,
}

fn member_id(destination: &Weak<Destination>) -> usize {
    destination.as_ptr() as usize
}

impl FailureCounter {
    /// Records a hard failure observed by `destination`.
    ///
    /// Returns `true` when this call took the endpoint out (or upgraded a
    /// soft TKO to hard) and `destination` is now responsible for probing.
    pub fn record_hard_failure(&self, destination: &Weak<Destination>) -> bool {
        let mut inner = self.inner.lock();
        inner.hard_failures = inner.hard_failures.saturating_add(1);

        match self.classification() {
            TkoClass::Healthy => {
                if self.hard_threshold == 0 || inner.hard_failures < self.hard_threshold {
                    return false;
                }
                self.set_classification(TkoClass::Hard);
                self.gauges.hard.fetch_add(1, Ordering::Relaxed);
                inner.responsible = Some(destination.clone());
                true
            }
            TkoClass::Soft => {
                if self.hard_threshold == 0 {
                    return false;
                }
                // Hard dominates soft: upgrade and re-elect the caller. The
                // previously responsible destination is released; its probe
                // loop winds down on its next probe reply.
                self.set_classification(TkoClass::Hard);
                self.gauges.soft.fetch_sub(1, Ordering::Relaxed);
                self.gauges.hard.fetch_add(1, Ordering::Relaxed);
                inner.responsible = Some(destination.clone());
                true
            }
            TkoClass::Hard => false,
        }
    }

    /// Records a soft failure observed by `destination`.
    ///
    /// Soft failures only take an endpoint out when one destination sees the
    /// configured number of them consecutively; interleaved successes from
    /// that destination reset its run.
    pub fn record_soft_failure(&self, destination: &Weak<Destination>) -> bool {
        let mut inner = self.inner.lock();
        inner.soft_failures = inner.soft_failures.saturating_add(1);

        let member = inner.members.entry(member_id(destination)).or_default();
        member.consecutive_soft = member.consecutive_soft.saturating_add(1);
        let crossed = self.soft_threshold != 0 && member.consecutive_soft >= self.soft_threshold;

        if self.classification() != TkoClass::Healthy || !crossed {
            return false;
        }

        self.set_classification(TkoClass::Soft);
        self.gauges.soft.fetch_add(1, Ordering::Relaxed);
        inner.responsible = Some(destination.clone());
        true
    }

    /// Records a success observed by `destination`.
    ///
    /// A success from the responsible destination resurrects the endpoint;
    /// a success from anyone else only resets that destination's own
    /// consecutive-soft run.
    pub fn record_success(&self, destination: &Weak<Destination>) {
        let mut inner = self.inner.lock();

        let responsible = inner
            .responsible
            .as_ref()
            .is_some_and(|r| Weak::ptr_eq(r, destination));
        if responsible {
            self.clear_tko(&mut inner);
        } else if let Some(member) = inner.members.get_mut(&member_id(destination)) {
            member.consecutive_soft = 0;
        }
    }

    /// Whether the endpoint is currently taken out, at any severity.
    #[must_use]
    pub fn is_tko(&self) -> bool {
        self.classification() != TkoClass::Healthy
    }

    #[must_use]
    pub fn is_hard_tko(&self) -> bool {
        self.classification() == TkoClass::Hard
    }

    #[must_use]
    pub fn is_soft_tko(&self) -> bool {
        self.classification() == TkoClass::Soft
    }

    /// Process-wide TKO totals.
    #[must_use]
    pub fn global_tkos(&self) -> GlobalTkos {
        self.gauges.snapshot()
    }

    pub(crate) fn add_destination(&self, destination: &Weak<Destination>) {
        self.inner
            .lock()
            .members
            .insert(member_id(destination), MemberState::default());
    }

    /// Withdraws `destination` from the endpoint. If it was responsible for
    /// the current TKO the endpoint is resurrected, otherwise nobody would
    /// be left to probe it back to life.
    pub(crate) fn remove_destination(&self, destination: &Weak<Destination>) {
        let mut inner = self.inner.lock();
        inner.members.remove(&member_id(destination));

        let responsible = inner
            .responsible
            .as_ref()
            .is_some_and(|r| Weak::ptr_eq(r, destination));
        if responsible {
            self.clear_tko(&mut inner);
        }
    }

    fn clear_tko(&self, inner: &mut CounterInner) {
        match self.classification() {
            TkoClass::Healthy => {}
            TkoClass::Soft => {
                self.gauges.soft.fetch_sub(1, Ordering::Relaxed);
            }
            TkoClass::Hard => {
                self.gauges.hard.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.set_classification(TkoClass::Healthy);
        inner.responsible = None;
        inner.hard_failures = 0;
        inner.soft_failures = 0;
        for member in inner.members.values_mut() {
            member.consecutive_soft = 0;
        }
    }

    fn classification(&self) -> TkoClass {
        TkoClass::from_u8(self.classification.load(Ordering::Acquire))
    }

    fn set_classification(&self, class: TkoClass) {
        self.classification.store(class as u8, Ordering::Release);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-worker bookkeeping of live destinations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pulse::Clock;

use crate::conn::ClientFactory;
use crate::destination::{Destination, DestinationState};
use crate::events::TkoEventHandler;
use crate::failure::SharedEndpointState;
use crate::options::{ConfigError, DestinationConfig, RouterOptions};

use std::sync::atomic::{AtomicU64, Ordering};

/// One gauge per local destination state.
///
/// Every state transition moves exactly two gauges by one; the sum over all
/// four therefore always equals the number of live destinations sharing this
/// instance. Share one instance across workers for process-wide server
/// counts.
#[derive(Debug, Default)]
pub struct StateGauges {
    servers_new: AtomicU64,
    servers_up: AtomicU64,
    servers_down: AtomicU64,
    servers_closed: AtomicU64,
}

impl StateGauges {
    #[must_use]
    pub fn num_servers_new(&self) -> u64 {
        self.servers_new.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_servers_up(&self) -> u64 {
        self.servers_up.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_servers_down(&self) -> u64 {
        self.servers_down.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_servers_closed(&self) -> u64 {
        self.servers_closed.load(Ordering::Relaxed)
    }

    /// Total number of live destinations.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.num_servers_new()
            + self.num_servers_up()
            + self.num_servers_down()
            + self.num_servers_closed()
    }

    fn gauge(&self, state: DestinationState) -> &AtomicU64 {
        match state {
            DestinationState::New => &self.servers_new,
            DestinationState::Up => &self.servers_up,
            DestinationState::Down => &self.servers_down,
            DestinationState::Closed => &self.servers_closed,
            DestinationState::Tko => unreachable!("tko is never a local state"),
        }
    }

    pub(crate) fn incr(&self, state: DestinationState) {
        self.gauge(state).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(&self, state: DestinationState) {
        self.gauge(state).fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn transition(&self, from: DestinationState, to: DestinationState) {
        self.decr(from);
        self.incr(to);
    }
}

/// Ambient dependencies a registry hands to every destination it creates.
#[derive(Clone)]
pub struct RegistryDeps {
    pub clock: Clock,
    pub factory: ClientFactory,
    pub gauges: Arc<StateGauges>,
    pub event_handler: Option<TkoEventHandler>,
}

impl std::fmt::Debug for RegistryDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDeps")
            .field("clock", &self.clock)
            .field("gauges", &self.gauges)
            .field("event_handler", &self.event_handler)
            .finish_non_exhaustive()
    }
}

/// The per-worker map of live destinations.
///
/// The registry holds only weak references; destinations are owned by the
/// routes using them and deregister themselves on drop. Destinations report
/// every real use through [`mark_as_active`][Self::mark_as_active], which
/// drives the idle sweep: a periodic
/// [`reset_inactive_destinations`][Self::reset_inactive_destinations] closes
/// the client of every destination that went unused since the previous
/// sweep.
#[derive(Debug)]
pub struct DestinationRegistry {
    options: Arc<RouterOptions>,
    deps: RegistryDeps,
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    map: HashMap<String, Weak<Destination>>,
    active: HashSet<String>,
}

impl DestinationRegistry {
    pub fn new(options: RouterOptions, deps: RegistryDeps) -> Result<Arc<Self>, ConfigError> {
        options.validate()?;
        Ok(Arc::new(Self {
            options: Arc::new(options),
            deps,
            inner: Mutex::new(RegistryInner::default()),
        }))
    }

    /// Creates a destination owned by the caller and tracked by this
    /// registry under `config.destination_key`.
    pub fn create_destination(
        self: &Arc<Self>,
        shared: Arc<SharedEndpointState>,
        config: DestinationConfig,
    ) -> Arc<Destination> {
        let destination = Destination::new(self, shared, config);
        self.inner.lock().map.insert(
            destination.key().to_string(),
            Arc::downgrade(&destination),
        );
        destination
    }

    /// Records that `destination` was just used for a request, shielding it
    /// from the next idle sweep.
    pub fn mark_as_active(&self, destination: &Destination) {
        self.inner
            .lock()
            .active
            .insert(destination.key().to_string());
    }

    /// Closes the client of every destination not used since the previous
    /// sweep, then starts a fresh observation period.
    pub fn reset_inactive_destinations(&self) {
        let idle: Vec<Arc<Destination>> = {
            let mut inner = self.inner.lock();
            inner.map.retain(|_, dest| dest.strong_count() > 0);
            let idle = inner
                .map
                .iter()
                .filter(|(key, _)| !inner.active.contains(*key))
                .filter_map(|(_, dest)| dest.upgrade())
                .collect();
            inner.active.clear();
            idle
        };

        // The resets run outside the lock: closing a client fires its down
        // callback, which walks back into the destination.
        for destination in idle {
            destination.reset_inactive();
        }
    }

    /// Number of live destinations currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map
            .values()
            .filter(|dest| dest.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn gauges(&self) -> &StateGauges {
        &self.deps.gauges
    }

    pub(crate) fn options(&self) -> &Arc<RouterOptions> {
        &self.options
    }

    pub(crate) fn deps(&self) -> &RegistryDeps {
        &self.deps
    }

    pub(crate) fn remove(&self, destination: &Destination) {
        let mut inner = self.inner.lock();
        let matches = inner
            .map
            .get(destination.key())
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), destination));
        if matches {
            inner.map.remove(destination.key());
        }
        inner.active.remove(destination.key());
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-worker destination object.
//!
//! A destination owns one logical connection to one backend endpoint,
//! observes every reply that comes back over it, feeds the shared failure
//! counter, and, when elected responsible for a TKO, drives the probe loop
//! that decides when the endpoint may return to service.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pulse::{Clock, Delay};

use crate::conn::{CacheClient, ConnectionHandle, SocketError};
use crate::events::{TkoEvent, TkoEventHandler, TkoEventKind};
use crate::failure::SharedEndpointState;
use crate::options::{AccessPoint, ConfigError, DestinationConfig, RouterOptions};
use crate::probe::ProbeScheduler;
use crate::registry::{DestinationRegistry, StateGauges};
use crate::reply::{Reply, ReplyResult, Request};

/// Observable state of a destination.
///
/// `New`, `Up`, `Down` and `Closed` are local connection states; `Tko`
/// overlays them whenever the shared counter has the endpoint taken out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    New = 0,
    Up = 1,
    Down = 2,
    Closed = 3,
    Tko = 4,
}

impl DestinationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Up => "up",
            Self::Down => "down",
            Self::Closed => "closed",
            Self::Tko => "tko",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Up,
            2 => Self::Down,
            3 => Self::Closed,
            _ => Self::Tko,
        }
    }
}

/// Timing context carried alongside one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    started_at: Instant,
}

impl RequestContext {
    /// Captures the submission time of a request on the worker's clock.
    #[must_use]
    pub fn start(clock: &Clock) -> Self {
        Self {
            started_at: clock.now(),
        }
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Exponential moving average over request latencies.
#[derive(Debug)]
struct LatencySmoother {
    smoothing: f64,
    value: f64,
    seeded: bool,
}

impl LatencySmoother {
    fn new(window_size: u32) -> Self {
        Self {
            smoothing: 1.0 / f64::from(window_size.max(1)),
            value: 0.0,
            seeded: false,
        }
    }

    fn insert_sample(&mut self, sample: f64) {
        if self.seeded {
            self.value += (sample - self.value) * self.smoothing;
        } else {
            self.value = sample;
            self.seeded = true;
        }
    }

    fn value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug)]
struct StatsInner {
    results: [AtomicU64; ReplyResult::COUNT],
    latency: Mutex<LatencySmoother>,
}

/// Point-in-time statistics snapshot of one destination.
#[derive(Debug, Clone)]
pub struct DestinationStats {
    results: [u64; ReplyResult::COUNT],
    avg_latency_us: f64,
}

impl DestinationStats {
    /// Number of replies observed with the given result.
    #[must_use]
    pub fn result(&self, result: ReplyResult) -> u64 {
        self.results[result.index()]
    }

    /// Smoothed request latency in microseconds.
    #[must_use]
    pub fn avg_latency_us(&self) -> f64 {
        self.avg_latency_us
    }
}

/// The per-worker object owning one logical connection to one backend
/// endpoint.
///
/// Destinations are created through
/// [`DestinationRegistry::create_destination`] and shared as
/// `Arc<Destination>`. Long-lived collaborators (the probe task, connection
/// callbacks) hold only weak handles: once the last owner drops the
/// destination, those callbacks fail their upgrade and return silently.
#[derive(Debug)]
pub struct Destination {
    key: String,
    access_point: AccessPoint,
    pool_name: String,
    qos: u64,
    options: Arc<RouterOptions>,
    clock: Clock,
    shared: Arc<SharedEndpointState>,
    registry: Weak<DestinationRegistry>,
    gauges: Arc<StateGauges>,
    event_handler: Option<TkoEventHandler>,
    conn: ConnectionHandle,
    probe: ProbeScheduler,
    stats: StatsInner,
    local_state: AtomicU8,
    shortest_timeout: Mutex<Duration>,
    resetting: AtomicBool,
    self_weak: Weak<Destination>,
}

impl Destination {
    pub(crate) fn new(
        registry: &Arc<DestinationRegistry>,
        shared: Arc<SharedEndpointState>,
        config: DestinationConfig,
    ) -> Arc<Self> {
        let options = Arc::clone(registry.options());
        let deps = registry.deps();

        let destination = Arc::new_cyclic(|me: &Weak<Self>| Self {
            key: config.destination_key,
            access_point: config.access_point,
            pool_name: config.pool_name,
            qos: config.qos,
            clock: deps.clock.clone(),
            registry: Arc::downgrade(registry),
            gauges: Arc::clone(&deps.gauges),
            event_handler: deps.event_handler.clone(),
            conn: ConnectionHandle::new(deps.factory.clone()),
            probe: ProbeScheduler::new(
                deps.clock.clone(),
                options.probe_delay_initial_ms,
                options.probe_delay_max_ms,
            ),
            stats: StatsInner {
                results: std::array::from_fn(|_| AtomicU64::new(0)),
                latency: Mutex::new(LatencySmoother::new(options.latency_window_size)),
            },
            local_state: AtomicU8::new(DestinationState::New as u8),
            shortest_timeout: Mutex::new(config.server_timeout),
            resetting: AtomicBool::new(false),
            self_weak: me.clone(),
            shared,
            options,
        });

        destination.gauges.incr(DestinationState::New);
        destination
            .shared
            .tko()
            .add_destination(&destination.self_weak);
        destination
    }

    /// Whether a request may be sent to this destination right now.
    #[must_use]
    pub fn may_send(&self) -> bool {
        !self.shared.tko().is_tko()
    }

    /// The observable state: `Tko` while the endpoint is taken out,
    /// otherwise the local connection state.
    #[must_use]
    pub fn state(&self) -> DestinationState {
        if self.shared.tko().is_tko() {
            DestinationState::Tko
        } else {
            self.local_state()
        }
    }

    #[must_use]
    pub fn stats(&self) -> DestinationStats {
        DestinationStats {
            results: std::array::from_fn(|i| self.stats.results[i].load(Ordering::Relaxed)),
            avg_latency_us: self.stats.latency.lock().value(),
        }
    }

    /// Observes one reply for a real request issued through this
    /// destination.
    pub fn on_reply(&self, reply: &Reply, ctx: &RequestContext) {
        self.stats.results[reply.result().index()].fetch_add(1, Ordering::Relaxed);
        let latency = self.clock.now().saturating_duration_since(ctx.started_at);
        self.stats
            .latency
            .lock()
            .insert_sample(latency.as_micros() as f64);

        self.handle_tko(reply, false);
    }

    /// Returns the wire client, creating it on first use, and marks this
    /// destination active for the idle sweep.
    pub fn client(self: &Arc<Self>) -> Result<Arc<dyn CacheClient>, ConfigError> {
        if let Some(registry) = self.registry.upgrade() {
            registry.mark_as_active(self);
        }
        self.conn.client_or_connect(self)
    }

    /// Forced teardown of an idle client. Idempotent; the down callback this
    /// triggers maps to `Closed` instead of `Down` and is not fed into the
    /// failure counter.
    pub fn reset_inactive(&self) {
        let Some(client) = self.conn.take() else {
            return;
        };

        self.resetting.store(true, Ordering::Release);
        client.close_now();
        drop(client);
        self.resetting.store(false, Ordering::Release);
    }

    /// Lowers the effective write timeout to `min(current, timeout)`.
    ///
    /// The shortest timeout across every route using this destination
    /// governs both real writes and probes. A zero timeout is a no-op.
    pub fn update_shortest_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }

        let mut current = self.shortest_timeout.lock();
        if current.is_zero() || *current > timeout {
            *current = timeout;
            self.conn.update_write_timeout(timeout);
        }
    }

    /// The effective write timeout, also used for probes.
    #[must_use]
    pub fn shortest_timeout(&self) -> Duration {
        *self.shortest_timeout.lock()
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn access_point(&self) -> &AccessPoint {
        &self.access_point
    }

    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<SharedEndpointState> {
        &self.shared
    }

    pub fn pending_request_count(&self) -> usize {
        self.conn.pending_request_count()
    }

    pub fn inflight_request_count(&self) -> usize {
        self.conn.inflight_request_count()
    }

    /// `(batched, total)` request counts of the underlying client.
    pub fn batching_stat(&self) -> (u64, u64) {
        self.conn.batching_stat()
    }

    pub(crate) fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub(crate) fn qos(&self) -> u64 {
        self.qos
    }

    pub(crate) fn sending_probes(&self) -> bool {
        self.probe.sending_probes()
    }

    pub(crate) fn next_probe_delay(&self) -> Delay {
        self.probe.next_probe_delay()
    }

    /// Issues one synthetic `version` probe and feeds its reply back into
    /// the classifier. Called from the probe loop task.
    pub(crate) async fn send_probe(self: &Arc<Self>) {
        self.probe.record_probe_sent();
        let timeout = self.shortest_timeout();

        let reply = match self.client() {
            Ok(client) => client.send(Request::version(), timeout).await,
            Err(error) => {
                tracing::event!(
                    name: "takeout.destination.probe_config_error",
                    tracing::Level::WARN,
                    endpoint = %self.shared.key(),
                    %error,
                );
                Reply::new(ReplyResult::ConnectError)
            }
        };

        self.handle_tko(&reply, true);
    }

    fn handle_tko(&self, reply: &Reply, is_probe: bool) {
        if self.resetting.load(Ordering::Acquire) || self.options.disable_tko_tracking {
            return;
        }

        let mut responsible = false;
        if reply.is_error() {
            if reply.is_hard_tko_error() {
                responsible = self.shared.tko().record_hard_failure(&self.self_weak);
                if responsible {
                    self.emit_tko_event(TkoEventKind::MarkHardTko, reply.result());
                }
            } else if reply.is_soft_tko_error() {
                responsible = self.shared.tko().record_soft_failure(&self.self_weak);
                if responsible {
                    self.emit_tko_event(TkoEventKind::MarkSoftTko, reply.result());
                }
            }
        } else if !self.probe.sending_probes() || is_probe {
            // While probing, only a probe reply may resurrect the endpoint:
            // a success from a request issued before the mark proves
            // nothing.
            self.unmark_tko(reply);
        }

        // A soft-to-hard upgrade can re-elect a destination that is already
        // probing; the running loop is kept in that case.
        if responsible && !self.probe.sending_probes() {
            self.probe.start(self.self_weak.clone());
        }
    }

    fn unmark_tko(&self, reply: &Reply) {
        self.shared.tko().record_success(&self.self_weak);
        if self.probe.sending_probes() {
            self.emit_tko_event(TkoEventKind::UnMarkTko, reply.result());
            self.probe.stop();
        }
    }

    pub(crate) fn on_up(&self) {
        debug_assert!(self.local_state() != DestinationState::Up);
        self.set_state(DestinationState::Up);

        tracing::event!(
            name: "takeout.destination.up",
            tracing::Level::INFO,
            endpoint = %self.shared.key(),
            servers_up = self.gauges.num_servers_up(),
            servers_total = self.gauges.total(),
        );
    }

    pub(crate) fn on_down(&self, error: &SocketError) {
        if self.resetting.load(Ordering::Acquire) {
            self.set_state(DestinationState::Closed);
            tracing::event!(
                name: "takeout.destination.inactive",
                tracing::Level::INFO,
                endpoint = %self.shared.key(),
                servers_up = self.gauges.num_servers_up(),
                servers_total = self.gauges.total(),
            );
        } else {
            self.set_state(DestinationState::Down);
            tracing::event!(
                name: "takeout.destination.down",
                tracing::Level::WARN,
                endpoint = %self.shared.key(),
                %error,
                servers_up = self.gauges.num_servers_up(),
                servers_total = self.gauges.total(),
            );
            self.handle_tko(&Reply::new(ReplyResult::ConnectError), false);
        }
    }

    fn local_state(&self) -> DestinationState {
        DestinationState::from_u8(self.local_state.load(Ordering::Acquire))
    }

    /// The only mutation point of the local state; keeps the per-state
    /// gauges in step with the transition.
    fn set_state(&self, new_state: DestinationState) {
        debug_assert!(new_state != DestinationState::Tko);
        let old_state =
            DestinationState::from_u8(self.local_state.swap(new_state as u8, Ordering::AcqRel));
        if old_state != new_state {
            self.gauges.transition(old_state, new_state);
        }
    }

    fn emit_tko_event(&self, kind: TkoEventKind, result: ReplyResult) {
        let tko = self.shared.tko();
        let event = TkoEvent {
            access_point: self.access_point.clone(),
            event: kind,
            is_hard_tko: tko.is_hard_tko(),
            is_soft_tko: tko.is_soft_tko(),
            global_tkos: tko.global_tkos(),
            avg_latency_us: self.stats.latency.lock().value(),
            probes_sent: self.probe.probes_sent(),
            pool_name: self.pool_name.clone(),
            result,
        };

        tracing::event!(
            name: "takeout.destination.tko",
            tracing::Level::INFO,
            endpoint = %self.shared.key(),
            pool = %event.pool_name,
            event = kind.as_str(),
            hard_tkos = event.global_tkos.hard_tkos,
            soft_tkos = event.global_tkos.soft_tkos,
            probes_sent = event.probes_sent,
            result = result.as_str(),
        );

        if let Some(handler) = &self.event_handler {
            handler.call(&event);
        }
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        self.shared.tko().remove_destination(&self.self_weak);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }

        self.conn.shutdown();

        if self.probe.sending_probes() {
            self.emit_tko_event(TkoEventKind::RemoveFromConfig, ReplyResult::Ok);
            self.probe.stop();
        }

        self.gauges.decr(self.local_state());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pulse::ClockControl;

    use super::*;
    use crate::events::TkoEventHandler;
    use crate::registry::RegistryDeps;
    use crate::test_util::{
        FakeClient, fake_factory, test_destination, test_endpoint, test_registry_with,
    };

    fn quick_options() -> RouterOptions {
        RouterOptions {
            probe_delay_initial_ms: 1,
            probe_delay_max_ms: 10,
            ..RouterOptions::default()
        }
    }

    fn capture_events() -> (TkoEventHandler, Arc<StdMutex<Vec<TkoEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = TkoEventHandler::new(move |event: &TkoEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (handler, seen)
    }

    fn registry_with_events(
        client: &Arc<FakeClient>,
        control: &ClockControl,
    ) -> (Arc<DestinationRegistry>, Arc<StdMutex<Vec<TkoEvent>>>) {
        let (handler, seen) = capture_events();
        let deps = RegistryDeps {
            clock: control.to_clock(),
            factory: fake_factory(Arc::clone(client)),
            gauges: Arc::new(StateGauges::default()),
            event_handler: Some(handler),
        };
        let registry = DestinationRegistry::new(quick_options(), deps).unwrap();
        (registry, seen)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Destination: Send, Sync);
        static_assertions::assert_impl_all!(DestinationStats: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn starts_new_and_may_send() {
        let registry = test_registry_with(quick_options(), Arc::new(FakeClient::default()));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        assert_eq!(dest.state(), DestinationState::New);
        assert!(dest.may_send());
    }

    #[tokio::test]
    async fn hard_error_marks_tko_and_emits_event() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        let ctx = RequestContext::start(&control.to_clock());
        dest.on_reply(&Reply::new(ReplyResult::ConnectError), &ctx);

        assert!(!dest.may_send());
        assert_eq!(dest.state(), DestinationState::Tko);
        assert!(dest.sending_probes());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, TkoEventKind::MarkHardTko);
        assert!(events[0].is_hard_tko);
        assert!(!events[0].is_soft_tko);
        assert_eq!(events[0].global_tkos.hard_tkos, 1);
        assert_eq!(events[0].result, ReplyResult::ConnectError);
        assert_eq!(events[0].pool_name, "test_pool");
    }

    #[tokio::test]
    async fn soft_errors_mark_after_consecutive_run() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        for _ in 0..2 {
            dest.on_reply(
                &Reply::new(ReplyResult::Timeout),
                &RequestContext::start(&clock),
            );
            assert!(dest.may_send());
        }

        dest.on_reply(
            &Reply::new(ReplyResult::Timeout),
            &RequestContext::start(&clock),
        );
        assert!(!dest.may_send());
        assert_eq!(events.lock().unwrap()[0].event, TkoEventKind::MarkSoftTko);
    }

    #[tokio::test]
    async fn success_interrupts_soft_run() {
        let registry = test_registry_with(quick_options(), Arc::new(FakeClient::default()));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = pulse::Clock::new_frozen();

        dest.on_reply(
            &Reply::new(ReplyResult::Timeout),
            &RequestContext::start(&clock),
        );
        dest.on_reply(
            &Reply::new(ReplyResult::Timeout),
            &RequestContext::start(&clock),
        );
        dest.on_reply(&Reply::new(ReplyResult::Ok), &RequestContext::start(&clock));
        dest.on_reply(
            &Reply::new(ReplyResult::Timeout),
            &RequestContext::start(&clock),
        );
        dest.on_reply(
            &Reply::new(ReplyResult::Timeout),
            &RequestContext::start(&clock),
        );

        assert!(dest.may_send(), "run was interrupted by the success");
    }

    #[tokio::test]
    async fn inflight_success_does_not_resurrect() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        dest.on_reply(
            &Reply::new(ReplyResult::ConnectError),
            &RequestContext::start(&clock),
        );
        assert!(dest.sending_probes());

        // A request that was in flight when the endpoint was marked comes
        // back fine; the endpoint must stay out.
        dest.on_reply(&Reply::new(ReplyResult::Ok), &RequestContext::start(&clock));

        assert!(!dest.may_send());
        assert!(dest.sending_probes());
        assert_eq!(events.lock().unwrap().len(), 1, "no unmark event");
    }

    #[tokio::test]
    async fn probe_success_resurrects() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        dest.on_reply(
            &Reply::new(ReplyResult::ConnectError),
            &RequestContext::start(&clock),
        );
        assert!(dest.sending_probes());

        client.push_reply(ReplyResult::Ok);
        dest.send_probe().await;

        assert!(dest.may_send());
        assert!(!dest.sending_probes());

        // The probe was a version request sent with the shortest timeout.
        let sent = client.sent();
        assert_eq!(sent, vec![(Request::version(), Duration::from_millis(100))]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, TkoEventKind::UnMarkTko);
        assert_eq!(events[1].probes_sent, 1);
        assert!(!events[1].is_hard_tko);
    }

    #[tokio::test]
    async fn failed_probe_keeps_probing() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        dest.on_reply(
            &Reply::new(ReplyResult::ConnectError),
            &RequestContext::start(&clock),
        );

        client.push_reply(ReplyResult::ConnectError);
        dest.send_probe().await;

        assert!(!dest.may_send());
        assert!(dest.sending_probes());
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_tracking_ignores_errors() {
        let client = Arc::new(FakeClient::default());
        let options = RouterOptions {
            disable_tko_tracking: true,
            ..quick_options()
        };
        let registry = test_registry_with(options, Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = pulse::Clock::new_frozen();

        dest.on_reply(
            &Reply::new(ReplyResult::ConnectError),
            &RequestContext::start(&clock),
        );

        assert!(dest.may_send());
        assert!(!dest.sending_probes());
        // Stats still count the reply.
        assert_eq!(dest.stats().result(ReplyResult::ConnectError), 1);
    }

    #[tokio::test]
    async fn reply_stats_and_latency_recorded() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, _) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        let ctx = RequestContext::start(&clock);
        control.advance(Duration::from_millis(2));
        dest.on_reply(&Reply::new(ReplyResult::Ok), &ctx);

        let stats = dest.stats();
        assert_eq!(stats.result(ReplyResult::Ok), 1);
        assert_eq!(stats.result(ReplyResult::ConnectError), 0);
        // First sample seeds the average directly.
        assert!((stats.avg_latency_us() - 2000.0).abs() < f64::EPSILON);

        let ctx = RequestContext::start(&clock);
        control.advance(Duration::from_millis(4));
        dest.on_reply(&Reply::new(ReplyResult::Ok), &ctx);

        // One step of the moving average: 2000 + (4000 - 2000) / 100.
        assert!((dest.stats().avg_latency_us() - 2020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn up_down_callbacks_drive_state_and_counter() {
        let client = Arc::new(FakeClient::default());
        let registry = test_registry_with(quick_options(), Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        dest.client().unwrap();
        client.trigger_up();
        assert_eq!(dest.state(), DestinationState::Up);
        assert_eq!(registry.gauges().num_servers_up(), 1);
        assert_eq!(registry.gauges().num_servers_new(), 0);

        client.trigger_down("connection refused");
        // The socket error is classified as a hard failure.
        assert_eq!(dest.state(), DestinationState::Tko);
        assert!(!dest.may_send());
        assert_eq!(registry.gauges().num_servers_down(), 1);
        assert_eq!(registry.gauges().num_servers_up(), 0);
        assert_eq!(registry.gauges().total(), 1);
    }

    #[tokio::test]
    async fn reset_inactive_maps_down_to_closed_without_counting() {
        let client = Arc::new(FakeClient::default());
        let registry = test_registry_with(quick_options(), Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        dest.client().unwrap();
        client.trigger_up();
        assert_eq!(dest.state(), DestinationState::Up);

        dest.reset_inactive();

        assert_eq!(dest.state(), DestinationState::Closed);
        assert!(dest.may_send(), "deliberate teardown is not a failure");
        assert!(!dest.sending_probes());
        assert_eq!(client.closed(), 1);

        // Idempotent: the client is already gone.
        dest.reset_inactive();
        assert_eq!(client.closed(), 1);
    }

    #[tokio::test]
    async fn shortest_timeout_is_monotone() {
        let client = Arc::new(FakeClient::default());
        let registry = test_registry_with(quick_options(), Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        dest.client().unwrap();

        assert_eq!(dest.shortest_timeout(), Duration::from_millis(100));

        dest.update_shortest_timeout(Duration::from_millis(250));
        assert_eq!(dest.shortest_timeout(), Duration::from_millis(100));

        dest.update_shortest_timeout(Duration::ZERO);
        assert_eq!(dest.shortest_timeout(), Duration::from_millis(100));

        dest.update_shortest_timeout(Duration::from_millis(40));
        assert_eq!(dest.shortest_timeout(), Duration::from_millis(40));
        assert_eq!(
            client.write_timeouts(),
            vec![Duration::from_millis(40)],
            "only the lowering is pushed to the client"
        );
    }

    #[tokio::test]
    async fn observers_default_to_zero_without_client() {
        let registry = test_registry_with(quick_options(), Arc::new(FakeClient::default()));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        assert_eq!(dest.pending_request_count(), 0);
        assert_eq!(dest.inflight_request_count(), 0);
        assert_eq!(dest.batching_stat(), (0, 0));
    }

    #[tokio::test]
    async fn throttle_applied_when_configured() {
        let client = Arc::new(FakeClient::default());
        let options = RouterOptions {
            target_max_inflight_requests: 64,
            target_max_pending_requests: 256,
            ..quick_options()
        };
        let registry = test_registry_with(options, Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        dest.client().unwrap();

        assert_eq!(client.throttle(), Some((64, 256)));
    }

    #[tokio::test]
    async fn client_built_from_destination_options() {
        let client = Arc::new(FakeClient::default());
        let options = RouterOptions {
            no_network: true,
            keepalive_cnt: 2,
            ..quick_options()
        };
        let registry = test_registry_with(options, Arc::clone(&client));
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");

        dest.client().unwrap();

        let built = client.built_with().expect("factory saw the options");
        assert_eq!(built.access_point.host, "d1");
        assert_eq!(built.access_point.port, 11211);
        assert_eq!(built.write_timeout, Duration::from_millis(100));
        assert!(built.no_network);
        assert_eq!(built.tcp_keep_alive.count, 2);
        assert!(built.tls.is_none());
    }

    #[tokio::test]
    async fn drop_while_probing_emits_remove_from_config() {
        let client = Arc::new(FakeClient::default());
        let control = ClockControl::new();
        let (registry, events) = registry_with_events(&client, &control);
        let shared = test_endpoint(1, 3);
        let dest = test_destination(&registry, &shared, "d1");
        let clock = control.to_clock();

        dest.on_reply(
            &Reply::new(ReplyResult::ConnectError),
            &RequestContext::start(&clock),
        );
        assert!(dest.sending_probes());

        drop(dest);

        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap().event, TkoEventKind::RemoveFromConfig);
        // The registry forgot the destination and the gauges went back to
        // zero.
        assert!(registry.is_empty());
        assert_eq!(registry.gauges().total(), 0);
    }

    #[tokio::test]
    async fn tls_endpoint_without_material_fails_client_init() {
        use crate::options::Transport;

        let registry = test_registry_with(quick_options(), Arc::new(FakeClient::default()));
        let shared = test_endpoint(1, 3);
        let dest = registry.create_destination(
            Arc::clone(&shared),
            DestinationConfig {
                access_point: AccessPoint::new("host", 11211).with_transport(Transport::Tls),
                destination_key: "tls".to_string(),
                server_timeout: Duration::from_millis(100),
                pool_name: "pool".to_string(),
                qos: 0,
            },
        );

        assert_eq!(dest.client().unwrap_err(), ConfigError::TlsPathsIncomplete);
    }
}

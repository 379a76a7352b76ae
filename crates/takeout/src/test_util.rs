// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared fixtures for the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use pulse::Clock;

use crate::conn::{CacheClient, ClientFactory, ConnectionOptions, SocketError, StatusCallbacks};
use crate::destination::Destination;
use crate::failure::{SharedEndpointState, TkoGauges};
use crate::options::{AccessPoint, DestinationConfig, RouterOptions};
use crate::registry::{DestinationRegistry, RegistryDeps, StateGauges};
use crate::reply::{Reply, ReplyResult, Request};

/// A scripted wire client. Replies are popped from a queue; with an empty
/// queue every request succeeds.
#[derive(Debug, Default)]
pub(crate) struct FakeClient {
    replies: Mutex<VecDeque<ReplyResult>>,
    callbacks: Mutex<Option<StatusCallbacks>>,
    sent: Mutex<Vec<(Request, Duration)>>,
    write_timeouts: Mutex<Vec<Duration>>,
    throttle: Mutex<Option<(usize, usize)>>,
    built_with: Mutex<Option<ConnectionOptions>>,
    closed: AtomicUsize,
}

impl FakeClient {
    pub fn push_reply(&self, result: ReplyResult) {
        self.replies.lock().push_back(result);
    }

    /// Fires the up callback the way a connecting client would.
    pub fn trigger_up(&self) {
        if let Some(callbacks) = &*self.callbacks.lock() {
            (callbacks.on_up)();
        }
    }

    /// Fires the down callback the way a failing socket would.
    pub fn trigger_down(&self, cause: &str) {
        if let Some(callbacks) = &*self.callbacks.lock() {
            (callbacks.on_down)(&SocketError(cause.to_string()));
        }
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Request, Duration)> {
        self.sent.lock().clone()
    }

    pub fn write_timeouts(&self) -> Vec<Duration> {
        self.write_timeouts.lock().clone()
    }

    pub fn throttle(&self) -> Option<(usize, usize)> {
        *self.throttle.lock()
    }

    pub fn built_with(&self) -> Option<ConnectionOptions> {
        self.built_with.lock().clone()
    }
}

impl CacheClient for FakeClient {
    fn send(&self, request: Request, timeout: Duration) -> BoxFuture<'_, Reply> {
        self.sent.lock().push((request, timeout));
        let result = self.replies.lock().pop_front().unwrap_or(ReplyResult::Ok);
        Box::pin(async move { Reply::new(result) })
    }

    fn close_now(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if let Some(callbacks) = &*self.callbacks.lock() {
            (callbacks.on_down)(&SocketError("connection closed".to_string()));
        }
    }

    fn set_status_callbacks(&self, callbacks: Option<StatusCallbacks>) {
        *self.callbacks.lock() = callbacks;
    }

    fn set_throttle(&self, max_inflight: usize, max_pending: usize) {
        *self.throttle.lock() = Some((max_inflight, max_pending));
    }

    fn update_write_timeout(&self, timeout: Duration) {
        self.write_timeouts.lock().push(timeout);
    }

    fn pending_request_count(&self) -> usize {
        self.replies.lock().len()
    }

    fn inflight_request_count(&self) -> usize {
        0
    }

    fn batching_stat(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// A factory that always hands out `client`, recording the options it was
/// built with.
pub(crate) fn fake_factory(client: Arc<FakeClient>) -> ClientFactory {
    Arc::new(move |options| {
        *client.built_with.lock() = Some(options.clone());
        Arc::clone(&client) as Arc<dyn CacheClient>
    })
}

pub(crate) fn test_registry() -> Arc<DestinationRegistry> {
    test_registry_with(
        RouterOptions {
            probe_delay_initial_ms: 1,
            probe_delay_max_ms: 10,
            ..RouterOptions::default()
        },
        Arc::new(FakeClient::default()),
    )
}

pub(crate) fn test_registry_with(
    options: RouterOptions,
    client: Arc<FakeClient>,
) -> Arc<DestinationRegistry> {
    DestinationRegistry::new(
        options,
        RegistryDeps {
            clock: Clock::new_frozen(),
            factory: fake_factory(client),
            gauges: Arc::new(StateGauges::default()),
            event_handler: None,
        },
    )
    .expect("test options must validate")
}

pub(crate) fn test_endpoint(hard_threshold: u32, soft_threshold: u32) -> Arc<SharedEndpointState> {
    SharedEndpointState::new(
        "endpoint:11211",
        hard_threshold,
        soft_threshold,
        TkoGauges::new(),
    )
}

pub(crate) fn test_destination(
    registry: &Arc<DestinationRegistry>,
    shared: &Arc<SharedEndpointState>,
    key: &str,
) -> Arc<Destination> {
    registry.create_destination(
        Arc::clone(shared),
        DestinationConfig {
            access_point: AccessPoint::new(key, 11211),
            destination_key: key.to_string(),
            server_timeout: Duration::from_millis(100),
            pool_name: "test_pool".to_string(),
            qos: 0,
        },
    )
}

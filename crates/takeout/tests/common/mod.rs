// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixtures shared by the integration tests.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use takeout::{
    CacheClient, ClientFactory, Operation, Reply, ReplyResult, Request, SocketError,
    StatusCallbacks, TkoEvent, TkoEventHandler, TkoEventKind,
};

/// A wire client whose first `fail_first` sends come back as connect
/// errors; everything after succeeds. Tracks how many sends overlap.
#[derive(Debug)]
pub struct TestClient {
    fail_remaining: AtomicUsize,
    send_delay: Option<Duration>,
    callbacks: Mutex<Option<StatusCallbacks>>,
    version_sends: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    closed: AtomicUsize,
}

impl TestClient {
    pub fn new(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(fail_first),
            send_delay: None,
            callbacks: Mutex::new(None),
            version_sends: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    /// Like [`new`][Self::new], but every send takes `delay` of real time,
    /// so overlapping sends become observable.
    pub fn with_send_delay(fail_first: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(fail_first),
            send_delay: Some(delay),
            callbacks: Mutex::new(None),
            version_sends: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn version_sends(&self) -> usize {
        self.version_sends.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl CacheClient for TestClient {
    fn send(&self, request: Request, _timeout: Duration) -> BoxFuture<'_, Reply> {
        if request.op() == Operation::Version {
            self.version_sends.fetch_add(1, Ordering::SeqCst);
        }

        Box::pin(async move {
            let now_running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now_running, Ordering::SeqCst);

            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }

            let result = if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok()
            {
                ReplyResult::ConnectError
            } else {
                ReplyResult::Ok
            };

            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Reply::new(result)
        })
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

    fn set_throttle(&self, _max_inflight: usize, _max_pending: usize) {}

    fn update_write_timeout(&self, _timeout: Duration) {}

    fn pending_request_count(&self) -> usize {
        0
    }

    fn inflight_request_count(&self) -> usize {
        self.concurrent.load(Ordering::SeqCst)
    }

    fn batching_stat(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// A factory that hands out the given clients in creation order and panics
/// if asked for more.
pub fn scripted_factory(clients: Vec<Arc<TestClient>>) -> ClientFactory {
    let remaining = StdMutex::new(clients.into_iter());
    Arc::new(move |_options| {
        let client = remaining
            .lock()
            .unwrap()
            .next()
            .expect("factory asked for more clients than scripted");
        client as Arc<dyn CacheClient>
    })
}

/// Captures TKO events for assertion.
pub fn capture_events() -> (TkoEventHandler, Arc<StdMutex<Vec<TkoEvent>>>) {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = TkoEventHandler::new(move |event: &TkoEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (handler, seen)
}

pub fn event_kinds(events: &StdMutex<Vec<TkoEvent>>) -> Vec<TkoEventKind> {
    events.lock().unwrap().iter().map(|e| e.event).collect()
}

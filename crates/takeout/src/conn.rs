// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam to the wire-level memcache client.
//!
//! Framing, multiplexing and TLS live behind [`CacheClient`], which the
//! embedding router implements. This module owns the lazy construction of
//! that client, wires its up/down callbacks back into the destination state
//! machine, and forwards the read-only connection observers.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::destination::Destination;
use crate::options::{AccessPoint, ConfigError, RouterOptions, Transport};
use crate::reply::{Reply, Request};

/// Describes why the transport went down; handed to the down callback.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SocketError(pub String);

/// Connection status callbacks installed on a client.
pub struct StatusCallbacks {
    pub on_up: Box<dyn Fn() + Send + Sync>,
    pub on_down: Box<dyn Fn(&SocketError) + Send + Sync>,
}

impl std::fmt::Debug for StatusCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCallbacks").finish()
    }
}

/// An asynchronous memcache client for a single endpoint.
///
/// Implementations multiplex requests over one connection and reconnect on
/// demand; a request submitted to a closed client re-establishes the
/// connection.
///
/// # Contract
///
/// - Replies are delivered in arrival order.
/// - Transport failures are folded into the reply (`connect_error`,
///   `timeout`, …); [`send`][CacheClient::send] itself never fails.
/// - [`close_now`][CacheClient::close_now] invokes the down callback
///   synchronously, before returning.
pub trait CacheClient: Send + Sync + std::fmt::Debug {
    /// Submits `request` and resolves with its reply no later than
    /// `timeout` after the write.
    fn send(&self, request: Request, timeout: Duration) -> BoxFuture<'_, Reply>;

    /// Drops the connection immediately, failing queued requests.
    fn close_now(&self);

    fn set_status_callbacks(&self, callbacks: Option<StatusCallbacks>);

    fn set_throttle(&self, max_inflight: usize, max_pending: usize);

    fn update_write_timeout(&self, timeout: Duration);

    fn pending_request_count(&self) -> usize;

    fn inflight_request_count(&self) -> usize;

    /// `(batched, total)` request counts, for batching-efficiency stats.
    fn batching_stat(&self) -> (u64, u64);
}

/// Builds a [`CacheClient`] from resolved connection options.
pub type ClientFactory = Arc<dyn Fn(&ConnectionOptions) -> Arc<dyn CacheClient> + Send + Sync>;

/// TCP keep-alive tuning. A zero probe `count` disables keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpKeepAlive {
    pub count: u32,
    pub idle: Duration,
    pub interval: Duration,
}

/// Paths to the PEM material for a TLS connection. All three are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Everything a factory needs to build a client for one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub access_point: AccessPoint,
    pub no_network: bool,
    pub tcp_keep_alive: TcpKeepAlive,
    pub write_timeout: Duration,
    pub enable_qos: bool,
    pub qos: u64,
    pub tls: Option<TlsPaths>,
}

impl ConnectionOptions {
    pub(crate) fn build(
        access_point: &AccessPoint,
        write_timeout: Duration,
        qos: u64,
        options: &RouterOptions,
    ) -> Result<Self, ConfigError> {
        let tls = if access_point.transport == Transport::Tls {
            if options.pem_cert_path.is_empty()
                || options.pem_key_path.is_empty()
                || options.pem_ca_path.is_empty()
            {
                return Err(ConfigError::TlsPathsIncomplete);
            }
            Some(TlsPaths {
                cert: PathBuf::from(&options.pem_cert_path),
                key: PathBuf::from(&options.pem_key_path),
                ca: PathBuf::from(&options.pem_ca_path),
            })
        } else {
            None
        };

        Ok(Self {
            access_point: access_point.clone(),
            no_network: options.no_network,
            tcp_keep_alive: TcpKeepAlive {
                count: options.keepalive_cnt,
                idle: Duration::from_secs(u64::from(options.keepalive_idle_s)),
                interval: Duration::from_secs(u64::from(options.keepalive_interval_s)),
            },
            write_timeout,
            enable_qos: options.enable_qos,
            qos,
            tls,
        })
    }
}

/// Lazily-created client slot for one destination.
pub(crate) struct ConnectionHandle {
    factory: ClientFactory,
    client: Mutex<Option<Arc<dyn CacheClient>>>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            client: Mutex::new(None),
        }
    }

    /// Returns the live client, building and wiring it on first use.
    pub fn client_or_connect(
        &self,
        destination: &Arc<Destination>,
    ) -> Result<Arc<dyn CacheClient>, ConfigError> {
        let mut slot = self.client.lock();
        if let Some(client) = &*slot {
            return Ok(Arc::clone(client));
        }

        let options = ConnectionOptions::build(
            destination.access_point(),
            destination.shortest_timeout(),
            destination.qos(),
            destination.options(),
        )?;
        let client = (self.factory)(&options);

        let up_target: Weak<Destination> = Arc::downgrade(destination);
        let down_target = up_target.clone();
        client.set_status_callbacks(Some(StatusCallbacks {
            on_up: Box::new(move || {
                if let Some(dest) = up_target.upgrade() {
                    dest.on_up();
                }
            }),
            on_down: Box::new(move |error: &SocketError| {
                if let Some(dest) = down_target.upgrade() {
                    dest.on_down(error);
                }
            }),
        }));

        if destination.options().target_max_inflight_requests > 0 {
            client.set_throttle(
                destination.options().target_max_inflight_requests,
                destination.options().target_max_pending_requests,
            );
        }

        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Takes the client out of the slot, callbacks intact, so the caller can
    /// close it and have the down callback observe the teardown.
    pub fn take(&self) -> Option<Arc<dyn CacheClient>> {
        self.client.lock().take()
    }

    /// Destruction path: silence the callbacks, then close.
    pub fn shutdown(&self) {
        if let Some(client) = self.client.lock().take() {
            client.set_status_callbacks(None);
            client.close_now();
        }
    }

    pub fn update_write_timeout(&self, timeout: Duration) {
        if let Some(client) = &*self.client.lock() {
            client.update_write_timeout(timeout);
        }
    }

    pub fn pending_request_count(&self) -> usize {
        self.client
            .lock()
            .as_ref()
            .map_or(0, |client| client.pending_request_count())
    }

    pub fn inflight_request_count(&self) -> usize {
        self.client
            .lock()
            .as_ref()
            .map_or(0, |client| client.inflight_request_count())
    }

    pub fn batching_stat(&self) -> (u64, u64) {
        self.client
            .lock()
            .as_ref()
            .map_or((0, 0), |client| client.batching_stat())
    }
}

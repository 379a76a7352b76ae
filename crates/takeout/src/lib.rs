// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-destination health tracking for a memcache request router.
//!
//! # Why?
//!
//! A request router fronts many backend servers through many worker threads.
//! When a backend dies, every worker notices independently; without
//! coordination each of them would keep sending doomed requests, and when
//! the backend comes back every worker would hammer it at once to find out.
//! This crate is the piece that coordinates: it classifies failures, decides
//! when an endpoint is taken out of rotation ("TKO"), elects exactly one
//! observer to probe it, and decides when it may return to service.
//!
//! # Overview
//!
//! - [`Destination`] - The per-worker object owning one logical connection
//!   to one backend endpoint. Exposes the whole upward surface:
//!   [`may_send`][Destination::may_send], [`on_reply`][Destination::on_reply],
//!   [`state`][Destination::state], [`stats`][Destination::stats],
//!   [`reset_inactive`][Destination::reset_inactive] and
//!   [`update_shortest_timeout`][Destination::update_shortest_timeout].
//! - [`SharedEndpointState`] / [`FailureCounter`] - Failure accounting
//!   shared by every destination that points at the same endpoint. Elects
//!   the single *responsible* destination when a threshold is crossed.
//! - [`DestinationRegistry`] - Per-worker map of live destinations; drives
//!   the idle sweep that closes unused clients.
//! - [`CacheClient`] - The seam to the wire-level client the embedding
//!   router provides.
//! - [`TkoEvent`] - Synchronous log record emitted on every classification
//!   change.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use takeout::{
//!     AccessPoint, DestinationConfig, DestinationRegistry, RegistryDeps, RouterOptions,
//!     SharedEndpointState, StateGauges, TkoGauges,
//! };
//!
//! # fn demo(factory: takeout::ClientFactory) -> Result<(), takeout::ConfigError> {
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # let _guard = rt.enter();
//! let registry = DestinationRegistry::new(
//!     RouterOptions::default(),
//!     RegistryDeps {
//!         clock: pulse::Clock::new_tokio(),
//!         factory,
//!         gauges: Arc::new(StateGauges::default()),
//!         event_handler: None,
//!     },
//! )?;
//!
//! let endpoint = SharedEndpointState::new("10.0.0.1:11211", 1, 3, TkoGauges::new());
//! let destination = registry.create_destination(
//!     endpoint,
//!     DestinationConfig {
//!         access_point: AccessPoint::new("10.0.0.1", 11211),
//!         destination_key: "10.0.0.1:11211".to_string(),
//!         server_timeout: Duration::from_millis(200),
//!         pool_name: "main".to_string(),
//!         qos: 0,
//!     },
//! );
//!
//! assert!(destination.may_send());
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! A destination belongs to one worker; the shared endpoint state is the
//! only thing workers contend on, and its readers are lock-free. Probe
//! tasks and connection callbacks hold weak handles and go quiet once the
//! destination is dropped.

mod conn;
mod destination;
mod events;
mod failure;
mod options;
mod probe;
mod registry;
mod reply;
mod rnd;

#[cfg(test)]
pub(crate) mod test_util;

pub use conn::{
    CacheClient, ClientFactory, ConnectionOptions, SocketError, StatusCallbacks, TcpKeepAlive,
    TlsPaths,
};
pub use destination::{Destination, DestinationState, DestinationStats, RequestContext};
pub use events::{TkoEvent, TkoEventHandler, TkoEventKind};
pub use failure::{FailureCounter, GlobalTkos, SharedEndpointState, TkoGauges};
pub use options::{
    AccessPoint, ConfigError, DestinationConfig, Protocol, RouterOptions, Transport,
};
pub use registry::{DestinationRegistry, RegistryDeps, StateGauges};
pub use reply::{Operation, Reply, ReplyResult, Request};

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for the health core.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Application-level memcache protocol spoken with an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ascii,
    Binary,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Binary => "binary",
        }
    }
}

/// Transport used to reach an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Tls,
}

impl Transport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
        }
    }
}

/// Network identity of a backend endpoint.
///
/// Multiple destinations (one per router worker) may point at the same
/// access point; they share one endpoint-scoped failure counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessPoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub transport: Transport,
}

impl AccessPoint {
    /// Creates an access point with the default `ascii` over `tcp` stack.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Ascii,
            transport: Transport::Tcp,
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }
}

impl Display for AccessPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.host,
            self.port,
            self.protocol.as_str(),
            self.transport.as_str()
        )
    }
}

/// A configuration problem detected while building a client or a registry.
///
/// Everything else this crate observes at runtime (socket errors, timeouts,
/// failed probes) is data fed to the state machine, not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tls transport requires pem_cert_path, pem_key_path and pem_ca_path to all be set")]
    TlsPathsIncomplete,

    #[error("probe_delay_initial_ms must be at least 1 and no greater than probe_delay_max_ms")]
    InvalidProbeDelays,

    #[error("latency_window_size must be non-zero")]
    InvalidLatencyWindow,
}

/// Router options relevant to destination health tracking.
///
/// Field names follow the router's configuration surface; times are plain
/// integers in the unit their name states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
    /// Delay before the first recovery probe, in milliseconds.
    pub probe_delay_initial_ms: u64,
    /// Upper bound for the probe delay, in milliseconds.
    pub probe_delay_max_ms: u64,
    /// Disables TKO tracking entirely; replies still update stats.
    pub disable_tko_tracking: bool,
    /// Window size for the average latency, in samples.
    pub latency_window_size: u32,
    /// Hard errors needed to take an endpoint out. Zero disables hard TKO.
    pub hard_tko_threshold: u32,
    /// Consecutive soft errors, from a single destination, needed to take an
    /// endpoint out. Zero disables soft TKO.
    pub soft_tko_threshold: u32,
    /// Throttle: maximum in-flight requests per client. Zero disables the
    /// throttle.
    pub target_max_inflight_requests: usize,
    /// Throttle: maximum queued requests per client.
    pub target_max_pending_requests: usize,
    /// Build clients that never touch the network (testing/shadow setups).
    pub no_network: bool,
    /// TCP keep-alive probe count. Zero disables keep-alive.
    pub keepalive_cnt: u32,
    /// TCP keep-alive idle time, in seconds.
    pub keepalive_idle_s: u32,
    /// TCP keep-alive probe interval, in seconds.
    pub keepalive_interval_s: u32,
    /// Tag outgoing connections with a quality-of-service class.
    pub enable_qos: bool,
    /// Client certificate path; required for TLS endpoints.
    pub pem_cert_path: String,
    /// Client key path; required for TLS endpoints.
    pub pem_key_path: String,
    /// Certificate authority path; required for TLS endpoints.
    pub pem_ca_path: String,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            probe_delay_initial_ms: 10_000,
            probe_delay_max_ms: 60_000,
            disable_tko_tracking: false,
            latency_window_size: 100,
            hard_tko_threshold: 1,
            soft_tko_threshold: 3,
            target_max_inflight_requests: 0,
            target_max_pending_requests: 0,
            no_network: false,
            keepalive_cnt: 0,
            keepalive_idle_s: 300,
            keepalive_interval_s: 60,
            enable_qos: false,
            pem_cert_path: String::new(),
            pem_key_path: String::new(),
            pem_ca_path: String::new(),
        }
    }
}

impl RouterOptions {
    /// Checks internal consistency. Called when a registry is built; the TLS
    /// path rule is checked later, at client initialisation, because it only
    /// applies to TLS endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_delay_initial_ms == 0 || self.probe_delay_initial_ms > self.probe_delay_max_ms
        {
            return Err(ConfigError::InvalidProbeDelays);
        }
        if self.latency_window_size == 0 {
            return Err(ConfigError::InvalidLatencyWindow);
        }
        Ok(())
    }
}

/// Per-route static configuration for one destination.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub access_point: AccessPoint,
    /// Key under which the destination registers with its worker's registry.
    pub destination_key: String,
    /// Initial write timeout; later lowered through
    /// [`update_shortest_timeout`][crate::Destination::update_shortest_timeout].
    pub server_timeout: Duration,
    /// Pool this destination belongs to; carried into TKO log events.
    pub pool_name: String,
    /// Quality-of-service class, applied when `enable_qos` is set.
    pub qos: u64,
}

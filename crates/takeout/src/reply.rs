// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reply model the health core observes.
//!
//! Health decisions are driven by reply classification, not by transport
//! errors: the wire client folds every failure mode into a [`ReplyResult`]
//! and this module decides which results count against an endpoint.

/// Result code carried by a memcache reply.
///
/// Only the codes the health core inspects are modeled; the embedding
/// router may map richer protocol results onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyResult {
    Ok,
    Stored,
    NotStored,
    Deleted,
    Found,
    NotFound,
    // Hard errors: the endpoint is unreachable or speaking garbage.
    ConnectError,
    ConnectTimeout,
    ProtocolError,
    // Soft errors: the endpoint is alive but struggling.
    Timeout,
    Busy,
    TryAgain,
    // Errors that say nothing about endpoint health.
    RemoteError,
}

impl ReplyResult {
    /// Every result code, in `index` order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Ok,
        Self::Stored,
        Self::NotStored,
        Self::Deleted,
        Self::Found,
        Self::NotFound,
        Self::ConnectError,
        Self::ConnectTimeout,
        Self::ProtocolError,
        Self::Timeout,
        Self::Busy,
        Self::TryAgain,
        Self::RemoteError,
    ];

    pub const COUNT: usize = 13;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Stored => "stored",
            Self::NotStored => "not_stored",
            Self::Deleted => "deleted",
            Self::Found => "found",
            Self::NotFound => "not_found",
            Self::ConnectError => "connect_error",
            Self::ConnectTimeout => "connect_timeout",
            Self::ProtocolError => "protocol_error",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::TryAgain => "try_again",
            Self::RemoteError => "remote_error",
        }
    }

    /// Whether this result is any kind of error.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ConnectError
                | Self::ConnectTimeout
                | Self::ProtocolError
                | Self::Timeout
                | Self::Busy
                | Self::TryAgain
                | Self::RemoteError
        )
    }

    /// Errors that take an endpoint out after a single threshold crossing:
    /// the connection could not be established, or the peer violated the
    /// protocol.
    #[must_use]
    pub fn is_hard_tko_error(self) -> bool {
        matches!(
            self,
            Self::ConnectError | Self::ConnectTimeout | Self::ProtocolError
        )
    }

    /// Errors that only count against an endpoint when they repeat: the
    /// endpoint answered, just not well.
    #[must_use]
    pub fn is_soft_tko_error(self) -> bool {
        matches!(self, Self::Timeout | Self::Busy | Self::TryAgain)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A reply observed by a destination, either from a real request or from a
/// probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    result: ReplyResult,
}

impl Reply {
    #[must_use]
    pub const fn new(result: ReplyResult) -> Self {
        Self { result }
    }

    #[must_use]
    pub const fn result(&self) -> ReplyResult {
        self.result
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.result.is_error()
    }

    #[must_use]
    pub fn is_hard_tko_error(&self) -> bool {
        self.result.is_hard_tko_error()
    }

    #[must_use]
    pub fn is_soft_tko_error(&self) -> bool {
        self.result.is_soft_tko_error()
    }
}

/// Operations the core submits to the wire client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Version,
    Get,
    Set,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
        }
    }
}

/// A request handed to the wire client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    op: Operation,
}

impl Request {
    #[must_use]
    pub const fn new(op: Operation) -> Self {
        Self { op }
    }

    /// The synthetic request used to probe a dead endpoint; `version` is the
    /// cheapest round-trip the protocol offers.
    #[must_use]
    pub const fn version() -> Self {
        Self::new(Operation::Version)
    }

    #[must_use]
    pub const fn op(&self) -> Operation {
        self.op
    }
}

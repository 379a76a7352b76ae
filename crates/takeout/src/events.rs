// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TKO log events.
//!
//! Every classification change of an endpoint produces one [`TkoEvent`],
//! emitted synchronously from the destination that caused it. Events go to
//! `tracing` unconditionally and, when configured, to a user-supplied
//! [`TkoEventHandler`].

use std::sync::Arc;

use crate::failure::GlobalTkos;
use crate::options::AccessPoint;
use crate::reply::ReplyResult;

/// The kind of classification change being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TkoEventKind {
    MarkHardTko,
    MarkSoftTko,
    UnMarkTko,
    /// The destination was destroyed while it was still probing, typically
    /// because the endpoint was removed from the router configuration.
    RemoveFromConfig,
}

impl TkoEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkHardTko => "mark_hard_tko",
            Self::MarkSoftTko => "mark_soft_tko",
            Self::UnMarkTko => "unmark_tko",
            Self::RemoveFromConfig => "remove_from_config",
        }
    }
}

/// A snapshot of one TKO classification change.
#[derive(Debug, Clone)]
pub struct TkoEvent {
    pub access_point: AccessPoint,
    pub event: TkoEventKind,
    pub is_hard_tko: bool,
    pub is_soft_tko: bool,
    pub global_tkos: GlobalTkos,
    /// Smoothed request latency of the reporting destination, microseconds.
    pub avg_latency_us: f64,
    /// Probes issued in the current episode at the time of the event.
    pub probes_sent: u64,
    pub pool_name: String,
    /// The reply result that triggered the change.
    pub result: ReplyResult,
}

/// User hook invoked synchronously for every [`TkoEvent`].
///
/// The handler runs on the worker that observed the reply; keep it cheap and
/// never block in it.
pub struct TkoEventHandler(Arc<dyn Fn(&TkoEvent) + Send + Sync>);

impl TkoEventHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&TkoEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    pub(crate) fn call(&self, event: &TkoEvent) {
        (self.0)(event);
    }
}

impl Clone for TkoEventHandler {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for TkoEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TkoEventHandler").finish()
    }
}

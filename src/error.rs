// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use thiserror::Error;

use crate::{codec::throwable::WireThrowable, ident::VersionedIdentifier};

/// Failure taxonomy for remote invocations.
///
/// Every non-declared failure a caller can observe is converted into one of
/// these variants; peer-side throwables travel the wire and surface as
/// [`RemoteError::Peer`] with addresses stamped and dispatch frames pruned.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// I/O on a closed or disconnected channel. Fatal to the in-flight call,
    /// not necessarily to the session.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Session shutdown observed locally; all subsequent invocations fail
    /// synchronously.
    #[error("session closed")]
    SessionClosed,

    /// Peer cannot find a skeleton for the identifier.
    #[error("no such object: {0}")]
    NoSuchObject(VersionedIdentifier),

    /// Peer cannot dispatch the selector (interface version mismatch).
    #[error("no such method: selector {0}")]
    NoSuchMethod(u32),

    /// A scheduled cancellation fired before the response arrived.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Worker pool saturated at invocation or accept time.
    #[error("task rejected: worker pool saturated or shut down")]
    Rejected,

    /// A value failed to serialize or deserialize.
    #[error("marshalling failed: {0}")]
    Marshal(String),

    /// Thrown by the skeleton's target on the peer and transported faithfully.
    #[error("remote exception: {0}")]
    Peer(Box<WireThrowable>),

    /// Local programming error (illegal re-batch, wrong argument shape).
    /// Never sent over the wire.
    #[error("illegal usage: {0}")]
    Illegal(String),
}

impl From<WireThrowable> for RemoteError {
    fn from(t: WireThrowable) -> Self {
        Self::Peer(Box::new(t))
    }
}

impl RemoteError {
    /// Wire form of this error, used when it must cross to the peer or feed
    /// a completion. Peer throwables pass through unchanged.
    pub fn to_throwable(&self) -> WireThrowable {
        match self {
            Self::Peer(t) => (**t).clone(),
            other => WireThrowable::new(other.class_name(), other.to_string()),
        }
    }

    /// Wire class name used when this error is transported as a throwable.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::TransportClosed(_) => "ClosedChannelException",
            Self::SessionClosed => "SessionClosedException",
            Self::NoSuchObject(_) => "NoSuchObjectException",
            Self::NoSuchMethod(_) => "NoSuchMethodException",
            Self::Timeout(_) => "RemoteTimeoutException",
            Self::Rejected => "RejectedException",
            Self::Marshal(_) => "MarshalException",
            Self::Peer(_) => "RemoteException",
            Self::Illegal(_) => "IllegalStateException",
        }
    }
}

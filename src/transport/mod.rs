// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Duplex byte transports the session multiplexes channels over.
//!
//! The core is transport-agnostic: anything able to open outbound streams to
//! the peer and accept inbound ones qualifies. Address strings are opaque to
//! the core and only used to stamp transported throwables.

pub mod mem;
pub mod tcp;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Duplex for T {}

pub type BoxedDuplex = Box<dyn Duplex>;

/// A bidirectional stream factory between exactly two peers.
pub trait Transport: Send + Sync + Sized + 'static {
    /// Opens a fresh outbound stream to the peer.
    fn open(&self) -> impl Future<Output = Result<BoxedDuplex>> + Send;

    /// Waits for the peer to open a stream towards us.
    fn accept(&self) -> impl Future<Output = Result<BoxedDuplex>> + Send;

    fn local_address(&self) -> &str;

    fn remote_address(&self) -> &str;

    /// Stops accepting and releases transport resources. Streams already
    /// handed out stay usable until closed individually.
    fn close(&self);
}

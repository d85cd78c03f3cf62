// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{BoxedDuplex, Transport};

/// Reference transport: every channel is one TCP connection. Each peer runs
/// a listener and knows the other's listener address, so channels can be
/// opened in either direction.
pub struct TcpTransport {
    listener: TcpListener,
    peer: String,
    local: String,
    closed: CancellationToken,
}

impl TcpTransport {
    /// Binds a listener on `local` (port 0 picks an ephemeral port) talking
    /// to a peer listening on `peer`.
    pub async fn bind(local: &str, peer: &str) -> Result<Self> {
        let listener = TcpListener::bind(local)
            .await
            .with_context(|| format!("failed to bind {local}"))?;
        Self::from_listener(listener, peer)
    }

    pub fn from_listener(listener: TcpListener, peer: &str) -> Result<Self> {
        let local = listener
            .local_addr()
            .context("listener has no local address")?
            .to_string();
        Ok(Self {
            listener,
            peer: peer.to_string(),
            local,
            closed: CancellationToken::new(),
        })
    }

    /// The bound listener address, for handing to the peer.
    pub fn listener_address(&self) -> &str {
        &self.local
    }
}

impl Transport for TcpTransport {
    async fn open(&self) -> Result<BoxedDuplex> {
        if self.closed.is_cancelled() {
            bail!("transport closed");
        }
        let stream = TcpStream::connect(&self.peer)
            .await
            .with_context(|| format!("failed to connect {}", self.peer))?;
        stream.set_linger(None)?;
        stream.set_nodelay(true)?;
        debug!("opened channel stream to {}", self.peer);
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<BoxedDuplex> {
        tokio::select! {
            _ = self.closed.cancelled() => bail!("transport closed"),
            accepted = self.listener.accept() => {
                let (stream, from) = accepted.context("accept failed")?;
                stream.set_nodelay(true)?;
                debug!("accepted channel stream from {from}");
                Ok(Box::new(stream))
            },
        }
    }

    fn local_address(&self) -> &str {
        &self.local
    }

    fn remote_address(&self) -> &str {
        &self.peer
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

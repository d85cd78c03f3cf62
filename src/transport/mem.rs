// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use tokio::{
    io::DuplexStream,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;

use crate::transport::{BoxedDuplex, Transport};

const STREAM_CAPACITY: usize = 64 * 1024;

/// Loopback transport over in-process byte pipes. Two halves form a pair;
/// opening on one half delivers the opposite end to the other half's
/// acceptor.
pub struct MemoryTransport {
    to_peer: mpsc::UnboundedSender<DuplexStream>,
    inbox: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    local: String,
    remote: String,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                to_peer: b_tx,
                inbox: Mutex::new(a_rx),
                local: "mem:left".to_string(),
                remote: "mem:right".to_string(),
                closed: CancellationToken::new(),
            },
            Self {
                to_peer: a_tx,
                inbox: Mutex::new(b_rx),
                local: "mem:right".to_string(),
                remote: "mem:left".to_string(),
                closed: CancellationToken::new(),
            },
        )
    }
}

impl Transport for MemoryTransport {
    async fn open(&self) -> Result<BoxedDuplex> {
        if self.closed.is_cancelled() {
            bail!("transport closed");
        }
        let (ours, theirs) = tokio::io::duplex(STREAM_CAPACITY);
        if self.to_peer.send(theirs).is_err() {
            bail!("peer transport dropped");
        }
        Ok(Box::new(ours))
    }

    async fn accept(&self) -> Result<BoxedDuplex> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => bail!("transport closed"),
            stream = inbox.recv() => match stream {
                Some(s) => Ok(Box::new(s)),
                None => bail!("peer transport dropped"),
            },
        }
    }

    fn local_address(&self) -> &str {
        &self.local
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One in-order duplex byte stream between peers, multiplexed from the
//! transport.
//!
//! Bytes are chunk-framed: the write side buffers into `BytesMut` and emits
//! `u16` big-endian length-prefixed chunks on flush. A zero-length chunk is
//! the **suspend marker**: the read side observes it as EOF until
//! [`Channel::input_resume`] rejoins normal framing, which is how pipe-mode
//! calls hand the raw stream to the user and later return it to the pool.
//!
//! Every channel carries a `CancellationToken` kill switch. Timeout tasks
//! and session close cancel the token; the owner sees the cancellation at
//! its next I/O operation. No channel is shared between owners: the pool
//! lends a channel to exactly one caller at a time.

pub mod pool;

use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use zerocopy::{
    IntoBytes,
    byteorder::{BigEndian, U16},
};

use crate::{codec::CodecError, transport::BoxedDuplex};

/// Largest chunk body; fits the u16 length prefix.
pub const CHUNK_MAX: usize = 0xFFFF;

/// Buffered output beyond this spills to the stream without an explicit
/// flush, bounding memory for large argument graphs.
const SPILL_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The kill switch fired: timeout task, pool shutdown or session close.
    #[error("channel cancelled")]
    Cancelled,

    #[error("channel {0} timed out")]
    Timeout(&'static str),

    /// The read side hit a suspend marker; resume before reading again.
    #[error("channel input suspended")]
    Suspended,

    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Race an I/O future against the kill switch and the per-operation budget.
async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, ChannelError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ChannelError::Timeout(label)),
            }
        }
    }
}

pub struct Channel {
    id: u64,
    stream: BoxedDuplex,
    cancel: CancellationToken,
    io_timeout: Duration,
    out: BytesMut,
    chunk_left: usize,
    suspended: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("suspended", &self.suspended)
            .field("buffered", &self.out.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        id: u64,
        stream: BoxedDuplex,
        cancel: CancellationToken,
        io_timeout: Duration,
    ) -> Self {
        Self {
            id,
            stream,
            cancel,
            io_timeout,
            out: BytesMut::with_capacity(8 * 1024),
            chunk_left: 0,
            suspended: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fires the kill switch. The owner observes it at the next I/O.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Clears buffered output and framing state before the channel is lent
    /// out again, so nothing from a previous call leaks into the next one.
    pub fn reset(&mut self) {
        self.out.clear();
        self.chunk_left = 0;
        self.suspended = false;
    }

    async fn raw_read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        io_with_timeout(
            "read",
            self.stream.read_exact(buf),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        Ok(())
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut off = 0;
        while off < buf.len() {
            if self.suspended {
                return Err(ChannelError::Suspended);
            }
            if self.chunk_left == 0 {
                let mut header = [0u8; 2];
                self.raw_read_exact(&mut header).await?;
                let len = u16::from_be_bytes(header) as usize;
                if len == 0 {
                    self.suspended = true;
                    return Err(ChannelError::Suspended);
                }
                self.chunk_left = len;
            }
            let n = self.chunk_left.min(buf.len() - off);
            let (start, end) = (off, off + n);
            self.raw_read_exact(&mut buf[start..end]).await?;
            self.chunk_left -= n;
            off = end;
        }
        Ok(())
    }

    /// Waits for the next inbound chunk without the per-operation deadline.
    /// Used by reader loops sitting on idle channels between requests; only
    /// the kill switch interrupts the wait.
    pub async fn await_chunk(&mut self) -> Result<(), ChannelError> {
        if self.suspended {
            return Err(ChannelError::Suspended);
        }
        if self.chunk_left > 0 {
            return Ok(());
        }
        let cancel = self.cancel.clone();
        let mut header = [0u8; 2];
        tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            res = self.stream.read_exact(&mut header) => {
                res?;
            },
        }
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            self.suspended = true;
            return Err(ChannelError::Suspended);
        }
        self.chunk_left = len;
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8, ChannelError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    /// Reads exactly `len` framed bytes into a fresh buffer.
    pub async fn read_bytes(&mut self, len: usize) -> Result<BytesMut, ChannelError> {
        let mut buf = BytesMut::zeroed(len);
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads and discards framed bytes until the peer's suspend marker.
    pub async fn drain_until_suspended(&mut self) -> Result<(), ChannelError> {
        let mut scratch = [0u8; 256];
        loop {
            match self.read_exact(&mut scratch).await {
                Ok(()) => {},
                Err(ChannelError::Suspended) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.out.extend_from_slice(data);
        if self.out.len() >= SPILL_THRESHOLD {
            self.write_buffered().await?;
        }
        Ok(())
    }

    async fn write_buffered(&mut self) -> Result<(), ChannelError> {
        while !self.out.is_empty() {
            let n = self.out.len().min(CHUNK_MAX);
            let header = U16::<BigEndian>::new(n as u16);
            io_with_timeout(
                "write",
                self.stream.write_all(header.as_bytes()),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
            let chunk = self.out.split_to(n);
            io_with_timeout(
                "write",
                self.stream.write_all(&chunk),
                self.io_timeout,
                &self.cancel,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.write_buffered().await?;
        io_with_timeout(
            "flush",
            self.stream.flush(),
            self.io_timeout,
            &self.cancel,
        )
        .await
    }

    /// Flushes buffered output and emits the suspend marker, signalling EOF
    /// to the peer's reader until it resumes.
    pub async fn suspend(&mut self) -> Result<(), ChannelError> {
        self.write_buffered().await?;
        let marker = U16::<BigEndian>::new(0);
        io_with_timeout(
            "write suspend marker",
            self.stream.write_all(marker.as_bytes()),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        io_with_timeout(
            "flush",
            self.stream.flush(),
            self.io_timeout,
            &self.cancel,
        )
        .await
    }

    /// Rejoins normal framing after a suspend marker was observed.
    pub fn input_resume(&mut self) {
        self.suspended = false;
    }

    /// Half-closes the write side. Irreversible.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Reads a varuint incrementally from the framed stream.
    pub async fn read_varuint(&mut self) -> Result<u32, ChannelError> {
        let first = self.read_u8().await?;
        let extra = match first {
            b if b < 0x80 => 0usize,
            b if b < 0xC0 => 1,
            b if b < 0xE0 => 2,
            b if b < 0xF0 => 3,
            _ => 4,
        };
        let mut raw = [0u8; 5];
        raw[0] = first;
        if extra > 0 {
            self.read_exact(&mut raw[1..=extra]).await?;
        }
        let mut slice: &[u8] = &raw[..=extra];
        Ok(crate::codec::wire::get_varuint(&mut slice)?)
    }
}

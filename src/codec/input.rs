// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Buf;

use crate::{
    channel::{Channel, ChannelError},
    codec::{
        CodecError, Status,
        throwable::WireThrowable,
        value::{Value, get_value},
    },
    ident::{IdentBytes, VersionedIdentifier},
};

/// Typed reader over a channel's framed read side, the mirror of
/// [`super::output::InvocationOutput`].
pub struct InvocationInput<'a> {
    ch: &'a mut Channel,
}

impl<'a> InvocationInput<'a> {
    pub fn new(ch: &'a mut Channel) -> Self {
        Self {
            ch,
        }
    }

    pub async fn read_u8(&mut self) -> Result<u8, ChannelError> {
        self.ch.read_u8().await
    }

    pub async fn read_status(&mut self) -> Result<Status, ChannelError> {
        let b = self.ch.read_u8().await?;
        Status::from_u8(b).ok_or_else(|| {
            ChannelError::Codec(CodecError::Invalid(format!(
                "unknown response status {b}"
            )))
        })
    }

    pub async fn read_varuint(&mut self) -> Result<u32, ChannelError> {
        self.ch.read_varuint().await
    }

    pub async fn read_identifier(
        &mut self,
    ) -> Result<VersionedIdentifier, ChannelError> {
        let mut bytes: IdentBytes = [0u8; 16];
        self.ch.read_exact(&mut bytes).await?;
        let local = self.ch.read_varuint().await?;
        let remote = self.ch.read_varuint().await?;
        Ok(VersionedIdentifier::from_parts(bytes, local, remote))
    }

    pub async fn read_ident_bytes(&mut self) -> Result<IdentBytes, ChannelError> {
        let mut bytes: IdentBytes = [0u8; 16];
        self.ch.read_exact(&mut bytes).await?;
        Ok(bytes)
    }

    /// Reads one length-prefixed value graph.
    pub async fn read_value(&mut self) -> Result<Value, ChannelError> {
        let len = self.ch.read_varuint().await? as usize;
        let body = self.ch.read_bytes(len).await?;
        let mut slice: &[u8] = &body;
        let value = get_value(&mut slice)?;
        if slice.has_remaining() {
            return Err(ChannelError::Codec(CodecError::Invalid(format!(
                "{} trailing bytes after value",
                slice.remaining()
            ))));
        }
        Ok(value)
    }

    /// Reads a value that must be a throwable.
    pub async fn read_throwable(&mut self) -> Result<WireThrowable, ChannelError> {
        match self.read_value().await? {
            Value::Throwable(t) => Ok(*t),
            other => Err(ChannelError::Codec(CodecError::Invalid(format!(
                "expected throwable, got {other:?}"
            )))),
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed writer over a channel's framed write side.
//!
//! Values travel as `varuint(byte length)` followed by the tagged encoding,
//! so the read side can buffer a whole graph before decoding. Identifiers
//! and selectors are small and self-delimiting, so they are written inline.

use bytes::{BufMut, BytesMut};

use crate::{
    channel::{Channel, ChannelError},
    codec::{
        Status,
        throwable::WireThrowable,
        value::{Value, put_value},
        wire::{put_identifier, put_varuint},
    },
    ident::VersionedIdentifier,
};

pub struct InvocationOutput<'a> {
    ch: &'a mut Channel,
    scratch: BytesMut,
}

impl<'a> InvocationOutput<'a> {
    pub fn new(ch: &'a mut Channel) -> Self {
        Self {
            ch,
            scratch: BytesMut::with_capacity(256),
        }
    }

    async fn put(&mut self) -> Result<(), ChannelError> {
        let bytes = self.scratch.split();
        self.ch.write_all(&bytes).await
    }

    pub async fn write_u8(&mut self, v: u8) -> Result<(), ChannelError> {
        self.scratch.put_u8(v);
        self.put().await
    }

    pub async fn write_status(&mut self, status: Status) -> Result<(), ChannelError> {
        self.write_u8(status as u8).await
    }

    pub async fn write_varuint(&mut self, v: u32) -> Result<(), ChannelError> {
        put_varuint(&mut self.scratch, v);
        self.put().await
    }

    pub async fn write_identifier(
        &mut self,
        id: &VersionedIdentifier,
    ) -> Result<(), ChannelError> {
        put_identifier(&mut self.scratch, id);
        self.put().await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.ch.write_all(bytes).await
    }

    /// Writes one length-prefixed value graph.
    pub async fn write_value(&mut self, value: &Value) -> Result<(), ChannelError> {
        let mut body = BytesMut::with_capacity(64);
        put_value(&mut body, value)?;
        put_varuint(&mut self.scratch, body.len() as u32);
        self.scratch.extend_from_slice(&body);
        self.put().await
    }

    pub async fn write_throwable(
        &mut self,
        t: WireThrowable,
    ) -> Result<(), ChannelError> {
        self.write_value(&Value::Throwable(Box::new(t))).await
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.ch.flush().await
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tagged value graph carried by invocations.
//!
//! Values are encoded as a one-byte tag followed by a fixed or
//! length-prefixed payload. Remote references are the only values with
//! session-dependent meaning: on write a local object must already have been
//! replaced by its marshalled form (the session performs the substitution
//! and the export side effects), and on read a [`RemoteRef::Marshalled`] is
//! produced for the session to resolve into a live stub or the local
//! original.

use std::{any::Any, fmt, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    codec::{
        CodecError,
        throwable::{WireThrowable, get_throwable, put_throwable},
        wire::{
            get_ident_bytes, get_opt_string, get_varuint, put_ident_bytes,
            put_opt_string, put_varuint,
        },
    },
    ident::{IdentBytes, VersionedIdentifier},
    remote::info::RemoteInfo,
    session::stub::Stub,
};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_F64: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_REMOTE: u8 = 8;
const TAG_THROWABLE: u8 = 9;

/// Nesting bound for list recursion; deeper graphs are rejected as
/// malformed rather than overflowing the decode stack.
const MAX_DEPTH: u32 = 64;

/// A local object offered for export: the implementation target plus the
/// interface description its skeleton dispatches on.
#[derive(Clone)]
pub struct LocalRemote {
    pub target: Arc<dyn Any + Send + Sync>,
    pub info: Arc<RemoteInfo>,
}

impl LocalRemote {
    pub fn new<T: Any + Send + Sync>(target: Arc<T>, info: Arc<RemoteInfo>) -> Self {
        Self {
            target,
            info,
        }
    }
}

impl fmt::Debug for LocalRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRemote")
            .field("info", &self.info.name)
            .finish_non_exhaustive()
    }
}

/// Wire form of a remote reference.
///
/// `info` rides along only on the first cross-wire transmission of a given
/// type on this session, saving the peer a descriptor round-trip.
#[derive(Debug, Clone)]
pub struct MarshalledRemote {
    pub id: VersionedIdentifier,
    pub type_id: IdentBytes,
    pub info: Option<Arc<RemoteInfo>>,
}

#[derive(Debug, Clone)]
pub enum RemoteRef {
    /// Undissolved wire form, or a local object already replaced for write.
    Marshalled(MarshalledRemote),
    /// Resolved proxy to a peer object.
    Stub(Arc<Stub>),
    /// A local object not yet exported; replaced by the session before write,
    /// or produced on read when the identifier denotes a local skeleton.
    Local(LocalRemote),
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Remote(RemoteRef),
    Throwable(Box<WireThrowable>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_stub(&self) -> Option<&Arc<Stub>> {
        match self {
            Self::Remote(RemoteRef::Stub(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// Structural equality for tests and registries; remote references compare by
// identifier.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Remote(a), Self::Remote(b)) => remote_key(a) == remote_key(b),
            (Self::Throwable(a), Self::Throwable(b)) => a == b,
            _ => false,
        }
    }
}

fn remote_key(r: &RemoteRef) -> Option<IdentBytes> {
    match r {
        RemoteRef::Marshalled(m) => Some(m.id.key()),
        RemoteRef::Stub(s) => Some(s.identifier().key()),
        RemoteRef::Local(_) => None,
    }
}

pub fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(v) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*v as u8);
        },
        Value::I32(v) => {
            buf.put_u8(TAG_I32);
            buf.put_i32(*v);
        },
        Value::I64(v) => {
            buf.put_u8(TAG_I64);
            buf.put_i64(*v);
        },
        Value::F64(v) => {
            buf.put_u8(TAG_F64);
            buf.put_f64(*v);
        },
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_opt_string(buf, Some(s));
        },
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_varuint(buf, b.len() as u32);
            buf.put_slice(b);
        },
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            put_varuint(buf, items.len() as u32);
            for item in items {
                put_value(buf, item)?;
            }
        },
        Value::Remote(RemoteRef::Marshalled(m)) => {
            buf.put_u8(TAG_REMOTE);
            put_marshalled(buf, m);
        },
        Value::Remote(RemoteRef::Stub(s)) => {
            buf.put_u8(TAG_REMOTE);
            put_marshalled(
                buf,
                &MarshalledRemote {
                    id: s.identifier(),
                    type_id: Stub::type_id(s),
                    info: None,
                },
            );
        },
        Value::Remote(RemoteRef::Local(lr)) => {
            return Err(CodecError::Invalid(format!(
                "local remote {} was not replaced before write",
                lr.info.name
            )));
        },
        Value::Throwable(t) => {
            buf.put_u8(TAG_THROWABLE);
            put_throwable(buf, t);
        },
    }
    Ok(())
}

pub fn get_value(buf: &mut impl Buf) -> Result<Value, CodecError> {
    get_value_bounded(buf, 0)
}

fn get_value_bounded(buf: &mut impl Buf, depth: u32) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::Invalid("value graph too deep".to_string()));
    }
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated(1));
    }
    let tag = buf.get_u8();
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            need(buf, 1)?;
            Value::Bool(buf.get_u8() != 0)
        },
        TAG_I32 => {
            need(buf, 4)?;
            Value::I32(buf.get_i32())
        },
        TAG_I64 => {
            need(buf, 8)?;
            Value::I64(buf.get_i64())
        },
        TAG_F64 => {
            need(buf, 8)?;
            Value::F64(buf.get_f64())
        },
        TAG_STR => Value::Str(get_opt_string(buf)?.unwrap_or_default()),
        TAG_BYTES => {
            let len = get_varuint(buf)? as usize;
            need(buf, len)?;
            Value::Bytes(buf.copy_to_bytes(len))
        },
        TAG_LIST => {
            let len = get_varuint(buf)? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(get_value_bounded(buf, depth + 1)?);
            }
            Value::List(items)
        },
        TAG_REMOTE => Value::Remote(RemoteRef::Marshalled(get_marshalled(buf)?)),
        TAG_THROWABLE => Value::Throwable(Box::new(get_throwable(buf)?)),
        other => {
            return Err(CodecError::Invalid(format!("unknown value tag {other}")));
        },
    })
}

fn put_marshalled(buf: &mut BytesMut, m: &MarshalledRemote) {
    crate::codec::wire::put_identifier(buf, &m.id);
    put_ident_bytes(buf, &m.type_id);
    match &m.info {
        Some(info) => {
            buf.put_u8(1);
            info.encode_to(buf);
        },
        None => buf.put_u8(0),
    }
}

fn get_marshalled(buf: &mut impl Buf) -> Result<MarshalledRemote, CodecError> {
    let id = crate::codec::wire::get_identifier(buf)?;
    let type_id = get_ident_bytes(buf)?;
    need(buf, 1)?;
    let info = if buf.get_u8() != 0 {
        Some(Arc::new(RemoteInfo::decode_from(buf)?))
    } else {
        None
    };
    Ok(MarshalledRemote {
        id,
        type_id,
        info,
    })
}

#[inline]
fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated(n - buf.remaining()));
    }
    Ok(())
}

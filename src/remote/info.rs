// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Serializable descriptions of remote interfaces.
//!
//! A [`RemoteInfo`] is deterministic for a given interface: interfaces are
//! kept sorted, methods keep declaration order, and the canonical encoding
//! feeds an MD5 digest that both peers derive independently, so the same
//! interface yields the same 16-byte type identifier on either side of the
//! wire. Method selectors are indexes into the method table; the skeleton
//! side dispatches on them with a plain match instead of generated code.

use bitflags::bitflags;
use bytes::{Buf, BytesMut};
use md5::{Digest, Md5};
use once_cell::sync::OnceCell;

use crate::{
    codec::{
        CodecError,
        wire::{get_string, get_varuint, put_string, put_varuint},
    },
    ident::IdentBytes,
};

bitflags! {
    /// Per-method behavior flags carried in the descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        /// Request is flushed and the channel released before the body runs.
        const ASYNCHRONOUS = 1;
        /// Request is buffered on the pinned channel until the batch closes.
        const BATCHED = 1 << 1;
        /// Successful return unexports the receiver's skeleton.
        const DISPOSER = 1 << 2;
        /// Calls preserve program order relative to other ordered methods.
        const ORDERED = 1 << 3;
        /// Asynchronous call paired with a completion callback.
        const COMPLETION = 1 << 4;
        /// The call hands the raw channel to the caller as a pipe.
        const PIPE = 1 << 5;
    }
}

/// Declared shape of one parameter or return slot.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    #[default]
    Void = 0,
    Bool = 1,
    I32 = 2,
    I64 = 3,
    F64 = 4,
    Str = 5,
    Bytes = 6,
    List = 7,
    Remote = 8,
    Any = 9,
}

impl TypeTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Void,
            1 => Self::Bool,
            2 => Self::I32,
            3 => Self::I64,
            4 => Self::F64,
            5 => Self::Str,
            6 => Self::Bytes,
            7 => Self::List,
            8 => Self::Remote,
            9 => Self::Any,
            _ => return None,
        })
    }
}

/// Timeout units a descriptor may declare.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    #[default]
    Millis = 0,
    Seconds = 1,
    Minutes = 2,
}

impl TimeUnit {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Millis,
            1 => Self::Seconds,
            2 => Self::Minutes,
            _ => return None,
        })
    }

    pub const fn to_millis(self, v: i64) -> i64 {
        match self {
            Self::Millis => v,
            Self::Seconds => v.saturating_mul(1_000),
            Self::Minutes => v.saturating_mul(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub flags: MethodFlags,
    pub params: Vec<TypeTag>,
    pub returns: TypeTag,
    pub throws: Vec<String>,
    /// Declared default: negative is infinite, zero expires immediately.
    pub timeout: Option<(i64, TimeUnit)>,
}

impl MethodInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: MethodFlags::empty(),
            params: Vec::new(),
            returns: TypeTag::Void,
            throws: Vec::new(),
            timeout: None,
        }
    }

    pub fn param(mut self, tag: TypeTag) -> Self {
        self.params.push(tag);
        self
    }

    pub fn returns(mut self, tag: TypeTag) -> Self {
        self.returns = tag;
        self
    }

    pub fn throws(mut self, class_name: &str) -> Self {
        self.throws.push(class_name.to_string());
        self
    }

    pub fn flag(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn timeout(mut self, value: i64, unit: TimeUnit) -> Self {
        self.timeout = Some((value, unit));
        self
    }

    pub fn is_asynchronous(&self) -> bool {
        self.flags.contains(MethodFlags::ASYNCHRONOUS)
    }

    pub fn is_batched(&self) -> bool {
        self.flags.contains(MethodFlags::BATCHED)
    }

    /// Declared default timeout in milliseconds, if any.
    pub fn timeout_millis(&self) -> Option<i64> {
        self.timeout.map(|(v, unit)| unit.to_millis(v))
    }
}

#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub name: String,
    /// Super-interface names, sorted for a canonical encoding.
    pub interfaces: Vec<String>,
    pub methods: Vec<MethodInfo>,
    /// Interface-level timeout default applied when a method declares none.
    pub timeout: Option<(i64, TimeUnit)>,

    type_id: OnceCell<IdentBytes>,
}

impl PartialEq for RemoteInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.interfaces == other.interfaces
            && self.methods == other.methods
            && self.timeout == other.timeout
    }
}

impl Eq for RemoteInfo {}

impl RemoteInfo {
    pub fn builder(name: &str) -> RemoteInfoBuilder {
        RemoteInfoBuilder {
            name: name.to_string(),
            interfaces: Vec::new(),
            methods: Vec::new(),
            timeout: None,
        }
    }

    /// Deterministic 16-byte identifier of this interface shape.
    pub fn type_id(&self) -> IdentBytes {
        *self.type_id.get_or_init(|| {
            let mut buf = BytesMut::with_capacity(256);
            self.encode_to(&mut buf);
            let mut hasher = Md5::new();
            hasher.update(&buf);
            hasher.finalize().into()
        })
    }

    pub fn method(&self, selector: u32) -> Option<&MethodInfo> {
        self.methods.get(selector as usize)
    }

    pub fn selector_of(&self, name: &str) -> Option<u32> {
        self.methods.iter().position(|m| m.name == name).map(|i| i as u32)
    }

    pub fn timeout_millis(&self) -> Option<i64> {
        self.timeout.map(|(v, unit)| unit.to_millis(v))
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        put_varuint(buf, self.interfaces.len() as u32);
        for name in &self.interfaces {
            put_string(buf, name);
        }
        put_timeout(buf, self.timeout);
        put_varuint(buf, self.methods.len() as u32);
        for m in &self.methods {
            put_string(buf, &m.name);
            put_varuint(buf, m.flags.bits());
            put_varuint(buf, m.params.len() as u32);
            for p in &m.params {
                buf.extend_from_slice(&[*p as u8]);
            }
            buf.extend_from_slice(&[m.returns as u8]);
            put_varuint(buf, m.throws.len() as u32);
            for t in &m.throws {
                put_string(buf, t);
            }
            put_timeout(buf, m.timeout);
        }
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let name = get_string(buf)?;
        let n_interfaces = get_varuint(buf)?;
        let mut interfaces = Vec::with_capacity(n_interfaces as usize);
        for _ in 0..n_interfaces {
            interfaces.push(get_string(buf)?);
        }
        let timeout = get_timeout(buf)?;
        let n_methods = get_varuint(buf)?;
        let mut methods = Vec::with_capacity(n_methods as usize);
        for _ in 0..n_methods {
            let name = get_string(buf)?;
            let flags = MethodFlags::from_bits(get_varuint(buf)?).ok_or_else(|| {
                CodecError::Invalid("unknown method flag bits".to_string())
            })?;
            let n_params = get_varuint(buf)?;
            let mut params = Vec::with_capacity(n_params as usize);
            for _ in 0..n_params {
                params.push(get_type_tag(buf)?);
            }
            let returns = get_type_tag(buf)?;
            let n_throws = get_varuint(buf)?;
            let mut throws = Vec::with_capacity(n_throws as usize);
            for _ in 0..n_throws {
                throws.push(get_string(buf)?);
            }
            let timeout = get_timeout(buf)?;
            methods.push(MethodInfo {
                name,
                flags,
                params,
                returns,
                throws,
                timeout,
            });
        }
        Ok(Self {
            name,
            interfaces,
            methods,
            timeout,
            type_id: OnceCell::new(),
        })
    }
}

pub struct RemoteInfoBuilder {
    name: String,
    interfaces: Vec<String>,
    methods: Vec<MethodInfo>,
    timeout: Option<(i64, TimeUnit)>,
}

impl RemoteInfoBuilder {
    pub fn extends(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn timeout(mut self, value: i64, unit: TimeUnit) -> Self {
        self.timeout = Some((value, unit));
        self
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn build(mut self) -> RemoteInfo {
        self.interfaces.sort_unstable();
        self.interfaces.dedup();
        RemoteInfo {
            name: self.name,
            interfaces: self.interfaces,
            methods: self.methods,
            timeout: self.timeout,
            type_id: OnceCell::new(),
        }
    }
}

fn put_timeout(buf: &mut BytesMut, t: Option<(i64, TimeUnit)>) {
    match t {
        Some((v, unit)) => {
            buf.extend_from_slice(&[1u8, unit as u8]);
            buf.extend_from_slice(&v.to_be_bytes());
        },
        None => buf.extend_from_slice(&[0u8]),
    }
}

fn get_timeout(buf: &mut impl Buf) -> Result<Option<(i64, TimeUnit)>, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated(1));
    }
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    if buf.remaining() < 9 {
        return Err(CodecError::Truncated(9 - buf.remaining()));
    }
    let unit = TimeUnit::from_u8(buf.get_u8())
        .ok_or_else(|| CodecError::Invalid("unknown time unit".to_string()))?;
    let v = buf.get_i64();
    Ok(Some((v, unit)))
}

fn get_type_tag(buf: &mut impl Buf) -> Result<TypeTag, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated(1));
    }
    let v = buf.get_u8();
    TypeTag::from_u8(v)
        .ok_or_else(|| CodecError::Invalid(format!("unknown type tag {v}")))
}

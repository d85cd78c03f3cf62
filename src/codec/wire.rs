// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Buffer-level primitives of the invocation wire format.
//!
//! Fixed-width values are big-endian. Variable-length unsigned integers use
//! 1-5 bytes, where the leading bits of the first byte gate the payload
//! width:
//!
//! ```text
//! 0xxxxxxx                                        7-bit payload
//! 10xxxxxx xxxxxxxx                              14-bit payload
//! 110xxxxx xxxxxxxx xxxxxxxx                     21-bit payload
//! 1110xxxx xxxxxxxx xxxxxxxx xxxxxxxx            28-bit payload
//! 11110--- xxxxxxxx xxxxxxxx xxxxxxxx xxxxxxxx  32-bit payload
//! ```
//!
//! Unshared strings are written as `varuint(len + 1)` (zero denotes null),
//! where `len` counts UTF-16 code units, followed by one encoded unit per
//! code point: `≤ 0x7F` in one byte, `≤ 0x3FFF` in two bytes prefixed `10`,
//! anything larger in three bytes prefixed `110` holding 21 bits. Decoders
//! combine well-formed surrogate pairs into a single code point, so streams
//! produced by UTF-16-oriented writers parse identically.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    codec::CodecError,
    ident::{IdentBytes, VersionedIdentifier},
};

#[inline]
fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated(n - buf.remaining()));
    }
    Ok(())
}

pub fn put_varuint(buf: &mut BytesMut, v: u32) {
    if v < 0x80 {
        buf.put_u8(v as u8);
    } else if v < 0x4000 {
        buf.put_u8(0x80 | (v >> 8) as u8);
        buf.put_u8(v as u8);
    } else if v < 0x20_0000 {
        buf.put_u8(0xC0 | (v >> 16) as u8);
        buf.put_u8((v >> 8) as u8);
        buf.put_u8(v as u8);
    } else if v < 0x1000_0000 {
        buf.put_u8(0xE0 | (v >> 24) as u8);
        buf.put_u8((v >> 16) as u8);
        buf.put_u8((v >> 8) as u8);
        buf.put_u8(v as u8);
    } else {
        buf.put_u8(0xF0);
        buf.put_u32(v);
    }
}

/// Number of bytes [`put_varuint`] emits for `v`.
pub const fn varuint_len(v: u32) -> usize {
    if v < 0x80 {
        1
    } else if v < 0x4000 {
        2
    } else if v < 0x20_0000 {
        3
    } else if v < 0x1000_0000 {
        4
    } else {
        5
    }
}

pub fn get_varuint(buf: &mut impl Buf) -> Result<u32, CodecError> {
    need(buf, 1)?;
    let b = buf.get_u8() as u32;
    Ok(if b < 0x80 {
        b
    } else if b < 0xC0 {
        need(buf, 1)?;
        ((b & 0x3F) << 8) | buf.get_u8() as u32
    } else if b < 0xE0 {
        need(buf, 2)?;
        ((b & 0x1F) << 16) | (buf.get_u8() as u32) << 8 | buf.get_u8() as u32
    } else if b < 0xF0 {
        need(buf, 3)?;
        ((b & 0x0F) << 24)
            | (buf.get_u8() as u32) << 16
            | (buf.get_u8() as u32) << 8
            | buf.get_u8() as u32
    } else {
        need(buf, 4)?;
        buf.get_u32()
    })
}

fn put_code_point(buf: &mut BytesMut, cp: u32) {
    if cp <= 0x7F {
        buf.put_u8(cp as u8);
    } else if cp <= 0x3FFF {
        buf.put_u8(0x80 | (cp >> 8) as u8);
        buf.put_u8(cp as u8);
    } else {
        buf.put_u8(0xC0 | (cp >> 16) as u8);
        buf.put_u8((cp >> 8) as u8);
        buf.put_u8(cp as u8);
    }
}

/// One encoded string unit. The returned value may be a surrogate half when
/// reading a stream written per UTF-16 unit.
fn get_unit(buf: &mut impl Buf) -> Result<u32, CodecError> {
    need(buf, 1)?;
    let b = buf.get_u8() as u32;
    Ok(if b < 0x80 {
        b
    } else if b < 0xC0 {
        need(buf, 1)?;
        ((b & 0x3F) << 8) | buf.get_u8() as u32
    } else if b < 0xE0 {
        need(buf, 2)?;
        ((b & 0x1F) << 16) | (buf.get_u8() as u32) << 8 | buf.get_u8() as u32
    } else {
        return Err(CodecError::Invalid(format!(
            "bad string unit prefix: 0x{b:02x}"
        )));
    })
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    let units: u32 = s
        .chars()
        .map(|c| if (c as u32) >= 0x1_0000 { 2u32 } else { 1 })
        .sum();
    put_varuint(buf, units + 1);
    for c in s.chars() {
        put_code_point(buf, c as u32);
    }
}

pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => put_string(buf, s),
        None => put_varuint(buf, 0),
    }
}

pub fn get_opt_string(buf: &mut impl Buf) -> Result<Option<String>, CodecError> {
    let n = get_varuint(buf)?;
    if n == 0 {
        return Ok(None);
    }
    let mut units = n - 1;
    let mut out = String::with_capacity(units as usize);
    while units > 0 {
        let unit = get_unit(buf)?;
        let (cp, used) = match unit {
            0xD800..=0xDBFF => {
                let lo = get_unit(buf)?;
                if !(0xDC00..=0xDFFF).contains(&lo) {
                    return Err(CodecError::Invalid(format!(
                        "unpaired high surrogate 0x{unit:04x}"
                    )));
                }
                (0x1_0000 + ((unit - 0xD800) << 10) + (lo - 0xDC00), 2)
            },
            0xDC00..=0xDFFF => {
                return Err(CodecError::Invalid(format!(
                    "unpaired low surrogate 0x{unit:04x}"
                )));
            },
            cp if cp >= 0x1_0000 => (cp, 2),
            cp => (cp, 1),
        };
        let c = char::from_u32(cp)
            .ok_or_else(|| CodecError::Invalid(format!("invalid code point 0x{cp:x}")))?;
        out.push(c);
        units = units
            .checked_sub(used)
            .ok_or_else(|| CodecError::Invalid("string unit overrun".to_string()))?;
    }
    Ok(Some(out))
}

pub fn get_string(buf: &mut impl Buf) -> Result<String, CodecError> {
    get_opt_string(buf)?
        .ok_or_else(|| CodecError::Invalid("unexpected null string".to_string()))
}

pub fn put_identifier(buf: &mut BytesMut, id: &VersionedIdentifier) {
    buf.put_slice(id.bytes());
    put_varuint(buf, id.local_version);
    put_varuint(buf, id.remote_version);
}

pub fn get_identifier(buf: &mut impl Buf) -> Result<VersionedIdentifier, CodecError> {
    need(buf, 16)?;
    let mut bytes: IdentBytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    let local = get_varuint(buf)?;
    let remote = get_varuint(buf)?;
    Ok(VersionedIdentifier::from_parts(bytes, local, remote))
}

pub fn put_ident_bytes(buf: &mut BytesMut, bytes: &IdentBytes) {
    buf.put_slice(bytes);
}

pub fn get_ident_bytes(buf: &mut impl Buf) -> Result<IdentBytes, CodecError> {
    need(buf, 16)?;
    let mut bytes: IdentBytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

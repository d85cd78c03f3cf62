// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use hex_literal::hex;
use rmi_session_rs::{
    codec::{
        value::{MarshalledRemote, RemoteRef, Value, get_value, put_value},
        wire::{
            get_identifier, get_opt_string, get_varuint, put_identifier,
            put_opt_string, put_string, put_varuint, varuint_len,
        },
    },
    ident::VersionedIdentifier,
    remote::info::{MethodFlags, MethodInfo, RemoteInfo, TimeUnit, TypeTag},
};

fn varuint_round_trip(v: u32) -> Result<usize> {
    let mut buf = BytesMut::new();
    put_varuint(&mut buf, v);
    let len = buf.len();
    let mut slice: &[u8] = &buf;
    assert_eq!(get_varuint(&mut slice)?, v, "varuint {v:#x} round trip");
    assert!(slice.is_empty(), "varuint {v:#x} left trailing bytes");
    Ok(len)
}

#[test]
fn test_varuint_boundaries() -> Result<()> {
    for (v, expected) in [
        (0u32, 1usize),
        (0x7F, 1),
        (0x80, 2),
        (0x3FFF, 2),
        (0x4000, 3),
        (0x1F_FFFF, 3),
        (0x20_0000, 4),
        (0xFFF_FFFF, 4),
        (0x1000_0000, 5),
        (u32::MAX, 5),
    ] {
        assert_eq!(varuint_round_trip(v)?, expected, "encoded width of {v:#x}");
        assert_eq!(varuint_len(v), expected);
    }
    Ok(())
}

#[test]
fn test_varuint_prefix_bits() {
    let mut buf = BytesMut::new();
    put_varuint(&mut buf, 0x80);
    assert_eq!(&buf[..], hex!("80 80"));

    buf.clear();
    put_varuint(&mut buf, 0x4000);
    assert_eq!(&buf[..], hex!("C0 40 00"));

    buf.clear();
    put_varuint(&mut buf, 0x1000_0000);
    assert_eq!(&buf[..], hex!("F0 10 00 00 00"));
}

#[test]
fn test_string_encoded_lengths() {
    // One byte per code point up to 0x7F, two up to 0x3FFF, three beyond;
    // the length prefix for these short strings is a single byte.
    for (s, body_len) in [("A", 1usize), ("é", 2), ("\u{4E2D}", 3), ("\u{1F600}", 3)] {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.len(), 1 + body_len, "encoding of {s:?}");
    }
}

#[test]
fn test_string_round_trip() -> Result<()> {
    for s in [
        "",
        "hello",
        "héllo wörld",
        "\u{4E2D}\u{6587}",
        "mixed \u{1F600} and ascii",
        "\u{10FFFF}",
    ] {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut slice: &[u8] = &buf;
        assert_eq!(get_opt_string(&mut slice)?.as_deref(), Some(s));
    }
    Ok(())
}

#[test]
fn test_string_null_sentinel() -> Result<()> {
    let mut buf = BytesMut::new();
    put_opt_string(&mut buf, None);
    assert_eq!(&buf[..], hex!("00"));
    let mut slice: &[u8] = &buf;
    assert_eq!(get_opt_string(&mut slice)?, None);
    Ok(())
}

#[test]
fn test_string_surrogate_pair_combines() -> Result<()> {
    // A UTF-16-oriented writer emits U+1F600 as the pair D83D/DE00, each as
    // a three-byte unit. The decoder must combine them.
    let mut buf = BytesMut::new();
    put_varuint(&mut buf, 2 + 1);
    for unit in [0xD83Du32, 0xDE00] {
        buf.extend_from_slice(&[
            0xC0 | (unit >> 16) as u8,
            (unit >> 8) as u8,
            unit as u8,
        ]);
    }
    let mut slice: &[u8] = &buf;
    assert_eq!(get_opt_string(&mut slice)?.as_deref(), Some("\u{1F600}"));
    Ok(())
}

#[test]
fn test_string_rejects_lone_surrogate() {
    let mut buf = BytesMut::new();
    put_varuint(&mut buf, 1 + 1);
    let unit = 0xDC00u32;
    buf.extend_from_slice(&[0xC0 | (unit >> 16) as u8, (unit >> 8) as u8, unit as u8]);
    let mut slice: &[u8] = &buf;
    assert!(get_opt_string(&mut slice).is_err());
}

#[test]
fn test_identifier_round_trip() -> Result<()> {
    let id = VersionedIdentifier::from_parts([7u8; 16], 3, 9);
    let mut buf = BytesMut::new();
    put_identifier(&mut buf, &id);
    assert_eq!(buf.len(), 16 + 1 + 1);
    let mut slice: &[u8] = &buf;
    let back = get_identifier(&mut slice)?;
    assert_eq!(back, id);
    assert_eq!(back.local_version, 3);
    assert_eq!(back.remote_version, 9);
    Ok(())
}

fn value_round_trip(v: &Value) -> Result<Value> {
    let mut buf = BytesMut::new();
    put_value(&mut buf, v)?;
    let mut slice: &[u8] = &buf;
    let back = get_value(&mut slice)?;
    assert!(slice.is_empty(), "trailing bytes after {v:?}");
    Ok(back)
}

#[test]
fn test_value_round_trips() -> Result<()> {
    let values = [
        Value::Null,
        Value::Bool(true),
        Value::I32(-42),
        Value::I64(1 << 40),
        Value::F64(3.5),
        Value::string("remote"),
        Value::Bytes(Bytes::from_static(b"\x00\x01\x02")),
        Value::List(vec![
            Value::I32(1),
            Value::List(vec![Value::string("nested")]),
            Value::Null,
        ]),
    ];
    for v in &values {
        assert_eq!(&value_round_trip(v)?, v);
    }
    Ok(())
}

#[test]
fn test_value_fixed_width_encoding() -> Result<()> {
    let mut buf = BytesMut::new();
    put_value(&mut buf, &Value::I32(1))?;
    assert_eq!(&buf[..], hex!("02 00 00 00 01"));

    buf.clear();
    put_value(&mut buf, &Value::Bool(false))?;
    assert_eq!(&buf[..], hex!("01 00"));
    Ok(())
}

fn sample_info() -> RemoteInfo {
    RemoteInfo::builder("test.Sample")
        .extends("test.Base")
        .timeout(5, TimeUnit::Seconds)
        .method(
            MethodInfo::new("ping")
                .param(TypeTag::Str)
                .returns(TypeTag::Str)
                .throws("PingException"),
        )
        .method(
            MethodInfo::new("fire")
                .flag(MethodFlags::ASYNCHRONOUS)
                .timeout(250, TimeUnit::Millis),
        )
        .build()
}

#[test]
fn test_remote_info_deterministic_id() {
    let a = sample_info();
    let b = sample_info();
    assert_eq!(a.type_id(), b.type_id());
    assert_eq!(a, b);

    let c = RemoteInfo::builder("test.Other").build();
    assert_ne!(a.type_id(), c.type_id());
}

#[test]
fn test_remote_info_encoding_round_trip() -> Result<()> {
    let info = sample_info();
    let mut buf = BytesMut::new();
    info.encode_to(&mut buf);
    let mut slice: &[u8] = &buf;
    let back = RemoteInfo::decode_from(&mut slice)?;
    assert_eq!(back, info);
    assert_eq!(back.type_id(), info.type_id());
    assert_eq!(back.method(1).map(|m| m.timeout_millis()), Some(Some(250)));
    assert_eq!(back.timeout_millis(), Some(5_000));
    Ok(())
}

#[test]
fn test_marshalled_remote_round_trip() -> Result<()> {
    let info = std::sync::Arc::new(sample_info());
    let m = MarshalledRemote {
        id: VersionedIdentifier::from_parts([9u8; 16], 1, 2),
        type_id: info.type_id(),
        info: Some(info.clone()),
    };
    let back = value_round_trip(&Value::Remote(RemoteRef::Marshalled(m.clone())))?;
    let Value::Remote(RemoteRef::Marshalled(got)) = back else {
        panic!("expected a marshalled remote");
    };
    assert_eq!(got.id, m.id);
    assert_eq!(got.id.local_version, 1);
    assert_eq!(got.type_id, m.type_id);
    assert_eq!(got.info.as_deref(), Some(info.as_ref()));
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rmi_session_rs::channel::{Channel, ChannelError, pool::ChannelPool};
use tokio_util::sync::CancellationToken;

use super::channel_pair;

#[tokio::test]
async fn test_framed_round_trip() -> Result<()> {
    let (mut a, mut b) = channel_pair();

    a.write_all(b"hello framed world").await?;
    a.flush().await?;

    let mut buf = [0u8; 18];
    b.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello framed world");
    Ok(())
}

#[tokio::test]
async fn test_large_payload_spans_chunks() -> Result<()> {
    let (mut a, mut b) = channel_pair();

    // Larger than one chunk and the spill threshold.
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        a.write_all(&payload).await?;
        a.flush().await?;
        Ok::<Channel, ChannelError>(a)
    });

    let mut got = vec![0u8; expected.len()];
    b.read_exact(&mut got).await?;
    assert_eq!(got, expected);
    writer.await?.map_err(anyhow::Error::from)?;
    Ok(())
}

#[tokio::test]
async fn test_suspend_marker_reads_as_eof_until_resume() -> Result<()> {
    let (mut a, mut b) = channel_pair();

    a.write_all(b"before").await?;
    a.suspend().await?;
    a.write_all(b"after!").await?;
    a.flush().await?;

    let mut buf = [0u8; 6];
    b.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"before");

    // The marker reads as EOF until the reader explicitly resumes.
    assert!(matches!(b.read_exact(&mut buf).await, Err(ChannelError::Suspended)));
    assert!(b.is_suspended());
    assert!(matches!(b.read_u8().await, Err(ChannelError::Suspended)));

    b.input_resume();
    b.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"after!");
    Ok(())
}

#[tokio::test]
async fn test_kill_switch_interrupts_reads() {
    let (_a, mut b) = channel_pair();
    let token = b.cancel_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let mut buf = [0u8; 1];
    let got = b.read_exact(&mut buf).await;
    assert!(matches!(got, Err(ChannelError::Cancelled)));
}

#[tokio::test]
async fn test_varuint_over_channel() -> Result<()> {
    let (mut a, mut b) = channel_pair();
    let mut scratch = bytes::BytesMut::new();
    for v in [0u32, 0x7F, 0x80, 0x4000, u32::MAX] {
        rmi_session_rs::codec::wire::put_varuint(&mut scratch, v);
    }
    a.write_all(&scratch).await?;
    a.flush().await?;

    for v in [0u32, 0x7F, 0x80, 0x4000, u32::MAX] {
        assert_eq!(b.read_varuint().await?, v);
    }
    Ok(())
}

#[tokio::test]
async fn test_pool_is_lifo_and_capped() {
    let pool = ChannelPool::new(2, Duration::from_secs(1));

    let mk = || {
        let (one, _other) = tokio::io::duplex(64);
        pool.adopt(Box::new(one))
    };
    let first = mk();
    let second = mk();
    let third = mk();
    let (first_id, second_id, third_id) = (first.id(), second.id(), third.id());

    pool.release(first, true);
    pool.release(second, true);
    assert_eq!(pool.idle_len(), 2);

    // Beyond the cap the channel is closed instead of kept.
    pool.release(third, true);
    assert_eq!(pool.idle_len(), 2);

    let top = pool.pop_idle().expect("idle channel");
    assert_eq!(top.id(), second_id, "most recently released comes back first");
    let next = pool.pop_idle().expect("idle channel");
    assert_eq!(next.id(), first_id);
    assert!(pool.pop_idle().is_none());
    assert_ne!(third_id, first_id);
}

#[tokio::test]
async fn test_pool_discards_cancelled_on_release() {
    let pool = ChannelPool::new(4, Duration::from_secs(1));
    let (one, _other) = tokio::io::duplex(64);
    let ch = pool.adopt(Box::new(one));
    ch.kill();
    pool.release(ch, true);
    assert_eq!(pool.idle_len(), 0);
}

#[tokio::test]
async fn test_pool_close_kills_lent_channels() {
    let pool = ChannelPool::new(4, Duration::from_secs(1));
    let (one, _other) = tokio::io::duplex(64);
    let lent = pool.adopt(Box::new(one));
    assert!(!lent.is_cancelled());

    pool.close();
    assert!(lent.is_cancelled(), "kill switch reaches lent channels");
    assert!(pool.is_closed());
}

#[tokio::test]
async fn test_reset_clears_framing_state() -> Result<()> {
    let (a, _b) = tokio::io::duplex(64);
    let mut ch = Channel::new(
        9,
        Box::new(a),
        CancellationToken::new(),
        Duration::from_secs(1),
    );
    ch.write_all(b"buffered but never flushed").await?;
    ch.reset();
    // After reset nothing of the aborted call leaks out on flush.
    ch.flush().await?;
    Ok(())
}

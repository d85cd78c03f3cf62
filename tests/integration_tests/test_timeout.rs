// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rmi_session_rs::{codec::value::Value, error::RemoteError};
use serial_test::serial;
use tokio::time::Instant;

use super::common::{ECHO, SLEEPY, echo_pair};

#[tokio::test]
#[serial]
async fn test_timeout_closes_the_call_not_the_session() -> Result<()> {
    let (_service, _server, client, stub) = echo_pair(5_000).await?;

    // Warm the pool so the before/after comparison is stable.
    stub.call(ECHO, vec![Value::string("warm")]).await?;
    let idle_before = client.idle_channels();

    let start = Instant::now();
    let err = stub
        .call_with_timeout(
            SLEEPY,
            vec![Value::I64(5_000)],
            Some(Duration::from_millis(100)),
        )
        .await
        .expect_err("the peer sleeps past the budget");
    let elapsed = start.elapsed();

    assert!(matches!(err, RemoteError::Timeout(d) if d == Duration::from_millis(100)));
    assert!(
        elapsed >= Duration::from_millis(100),
        "failed before the budget: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1_000),
        "timeout fired far too late: {elapsed:?}"
    );

    // The session survives; a fresh call works on a fresh channel.
    let reply = stub.call(ECHO, vec![Value::string("alive")]).await?;
    assert_eq!(reply.as_str(), Some("alive"));

    // The timed-out channel was closed, not pooled: once the follow-up call
    // returns its channel, the pool is back to its pre-call size.
    assert_eq!(client.idle_channels(), idle_before);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_timeout_task_is_cancelled_on_normal_completion() -> Result<()> {
    let (_service, _server, client, stub) = echo_pair(5_000).await?;

    let scheduled_before = client.scheduled_tasks();
    let reply = stub
        .call_with_timeout(
            ECHO,
            vec![Value::string("fast")],
            Some(Duration::from_secs(30)),
        )
        .await?;
    assert_eq!(reply.as_str(), Some("fast"));

    // Cancellation removed the timeout immediately; nothing lingers until
    // the deadline.
    assert_eq!(client.scheduled_tasks(), scheduled_before);
    Ok(())
}

#[tokio::test]
async fn test_zero_timeout_is_a_best_effort_attempt() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(5_000).await?;
    let outcome = stub
        .call_with_timeout(
            SLEEPY,
            vec![Value::I64(2_000)],
            Some(Duration::ZERO),
        )
        .await;
    // Zero expires immediately; the attempt may only win by racing the timer.
    assert!(matches!(
        outcome,
        Err(RemoteError::Timeout(_)) | Err(RemoteError::TransportClosed(_)) | Ok(_)
    ));
    Ok(())
}

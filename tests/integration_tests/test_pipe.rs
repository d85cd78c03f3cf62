// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use rmi_session_rs::codec::value::Value;

use super::common::{ECHO, PIPE_ECHO, echo_pair};

#[tokio::test]
async fn test_request_reply_pipe_round_trip() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(2_000).await?;

    let mut pipe = stub.request_reply(PIPE_ECHO, vec![]).await?;
    pipe.write_value(&Value::string("through the pipe")).await?;
    pipe.flush().await?;

    let reply = pipe.read_value().await?;
    assert_eq!(reply.as_str(), Some("through the pipe"));

    // Closing recycles the channel back to the pool on both sides.
    pipe.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_channel_survives_pipe_recycling() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(2_000).await?;

    let mut pipe = stub.request_reply(PIPE_ECHO, vec![]).await?;
    pipe.write_value(&Value::I64(7)).await?;
    pipe.flush().await?;
    assert_eq!(pipe.read_value().await?.as_i64(), Some(7));
    pipe.close().await?;

    // The recycled byte stream rejoins normal framing for ordinary calls.
    for i in 0..3 {
        let reply = stub
            .call(ECHO, vec![Value::string(&format!("after-{i}"))])
            .await?;
        assert_eq!(reply.as_str(), Some(format!("after-{i}").as_str()));
    }
    Ok(())
}

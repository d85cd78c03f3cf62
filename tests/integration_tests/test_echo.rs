// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rmi_session_rs::{
    codec::value::{LocalRemote, Value},
    error::RemoteError,
};
use serial_test::serial;

use super::common::{
    ECHO, BOOM, POKE, EchoClient, EchoService, echo_exports, echo_info, echo_pair,
    plain_exports, session_pair, test_config,
};

#[tokio::test]
async fn test_echo_round_trip() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(2_000).await?;
    let reply = stub.call(ECHO, vec![Value::string("hello")]).await?;
    assert_eq!(reply.as_str(), Some("hello"));
    Ok(())
}

#[tokio::test]
async fn test_lookup_unknown_name_is_none() -> Result<()> {
    let (_service, _server, client, _stub) = echo_pair(2_000).await?;
    assert!(client.lookup("nope").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_typed_proxy_via_stub_factory() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(2_000).await?;
    let typed = stub
        .typed()
        .expect("stub factory ran")
        .clone()
        .downcast::<EchoClient>()
        .expect("typed proxy is an EchoClient");
    assert_eq!(typed.echo("typed").await?, "typed");
    Ok(())
}

#[tokio::test]
async fn test_shared_object_exchange() -> Result<()> {
    let service = EchoService::new();
    let shared = LocalRemote::new(Arc::clone(&service), echo_info());
    let (server, client) = session_pair(
        test_config(2_000),
        test_config(2_000),
        echo_exports(Arc::clone(&service)).share(shared),
        plain_exports(),
    )
    .await?;

    let received = client.receive().await?.expect("peer shared a server object");
    let stub = received.as_stub().expect("shared object resolves to a stub");
    let reply = stub.call(ECHO, vec![Value::string("shared")]).await?;
    assert_eq!(reply.as_str(), Some("shared"));

    // The other direction was never deposited; send null explicitly.
    client.send(None).await?;
    assert!(server.receive().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_poke() -> Result<()> {
    let (service, _server, _client, stub) = echo_pair(2_000).await?;
    for _ in 0..3 {
        stub.call_async(POKE, vec![]).await?;
    }
    // The request is flushed before the body runs; give the peer a beat.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.pokes.load(std::sync::atomic::Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_failure_chain_crosses_the_wire() -> Result<()> {
    let (_service, _server, _client, stub) = echo_pair(2_000).await?;
    let err = stub.call(BOOM, vec![]).await.expect_err("boom throws");
    let RemoteError::Peer(throwable) = err else {
        panic!("expected a peer exception, got {err}");
    };
    assert_eq!(throwable.class_name(), "AException");
    assert_eq!(throwable.message(), "outer failed");
    assert_eq!(throwable.cause_count(), 2);
    assert_eq!(throwable.chain[1].class_name, "BException");
    assert_eq!(throwable.chain[2].class_name, "CException");
    assert!(!throwable.remote_address.is_empty(), "addresses are stamped");
    // Dispatch frames are pruned before transport.
    for entry in &throwable.chain {
        assert!(entry.frames.iter().all(|f| {
            f.file != rmi_session_rs::codec::throwable::DISPATCH_MARKER_FILE
        }));
    }
    assert!(
        throwable.chain[0].frames.iter().any(|f| f.file == "echo_service.rs"),
        "application frames survive pruning"
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_dropped_stub_reclaims_peer_skeleton() -> Result<()> {
    let (_service, server, client, stub) = echo_pair(200).await?;
    let baseline = server.skeleton_count();

    // The stub is live, so the skeleton stays put.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.skeleton_count(), baseline);

    drop(stub);
    // One heartbeat of quiescence and the disposal batch lands.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.skeleton_count(), baseline - 1, "skeleton reclaimed");

    // The name table survives peer-driven disposal: a new lookup re-binds.
    let again = client.lookup("echo").await?.expect("echo still exported");
    let reply = again.call(ECHO, vec![Value::string("back")]).await?;
    assert_eq!(reply.as_str(), Some("back"));
    Ok(())
}

#[tokio::test]
async fn test_proactive_dispose_tombstones_stub() -> Result<()> {
    let (_service, server, client, stub) = echo_pair(2_000).await?;
    let before = server.skeleton_count();

    client.dispose(&stub).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.skeleton_count(), before - 1);

    let err = stub.call(ECHO, vec![Value::string("x")]).await.expect_err(
        "disposed stub fails synchronously",
    );
    assert!(matches!(err, RemoteError::NoSuchObject(_)), "got {err}");
    Ok(())
}

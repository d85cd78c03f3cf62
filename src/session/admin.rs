// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The hidden remote interface each peer exposes to the other.
//!
//! Admin negotiates lifecycle: the shared server object, type descriptor
//! fetches, disposal notifications, heartbeats, orderly close, the batch
//! terminator and name lookup. Everything is asynchronous except
//! `get_remote_info`, `sync` and `lookup`; `disposed_batch` is batched so
//! reclamation piggybacks on one channel write.

use std::{any::Any, sync::Arc};

use bytes::{Bytes, BytesMut};
use once_cell::sync::{Lazy, OnceCell};

use crate::{
    codec::throwable::WireThrowable,
    codec::value::Value,
    error::RemoteError,
    ident::{IdentBytes, VersionedIdentifier},
    remote::{
        completion::CompletionState,
        info::{MethodFlags, MethodInfo, RemoteInfo, TypeTag},
    },
    session::{BoxFut, skeleton::Skeleton, stub::{Batch, Stub}},
};

pub const SET_REMOTE_SERVER: u32 = 0;
pub const GET_REMOTE_INFO: u32 = 1;
pub const DISPOSED: u32 = 2;
pub const DISPOSED_BATCH: u32 = 3;
pub const HEARTBEAT: u32 = 4;
pub const CLOSED: u32 = 5;
pub const SYNC: u32 = 6;
pub const LOOKUP: u32 = 7;

pub const COMPLETION_COMPLETE: u32 = 0;
pub const COMPLETION_FAIL: u32 = 1;

static ADMIN_INFO: Lazy<Arc<RemoteInfo>> = Lazy::new(|| {
    Arc::new(
        RemoteInfo::builder("session.Admin")
            .method(
                MethodInfo::new("set_remote_server")
                    .param(TypeTag::Any)
                    .flag(MethodFlags::ASYNCHRONOUS),
            )
            .method(
                MethodInfo::new("get_remote_info")
                    .param(TypeTag::Bytes)
                    .returns(TypeTag::Bytes),
            )
            .method(
                MethodInfo::new("disposed")
                    .param(TypeTag::Bytes)
                    .flag(MethodFlags::ASYNCHRONOUS),
            )
            .method(
                MethodInfo::new("disposed_batch")
                    .param(TypeTag::List)
                    .flag(MethodFlags::BATCHED),
            )
            .method(MethodInfo::new("heartbeat").flag(MethodFlags::ASYNCHRONOUS))
            .method(MethodInfo::new("closed").flag(MethodFlags::ASYNCHRONOUS))
            .method(MethodInfo::new("sync"))
            .method(
                MethodInfo::new("lookup")
                    .param(TypeTag::Str)
                    .returns(TypeTag::Remote),
            )
            .build(),
    )
});

static COMPLETION_INFO: Lazy<Arc<RemoteInfo>> = Lazy::new(|| {
    Arc::new(
        RemoteInfo::builder("session.RemoteCompletion")
            .method(
                MethodInfo::new("complete")
                    .param(TypeTag::Any)
                    .flag(MethodFlags::ASYNCHRONOUS),
            )
            .method(
                MethodInfo::new("fail")
                    .param(TypeTag::Any)
                    .flag(MethodFlags::ASYNCHRONOUS),
            )
            .build(),
    )
});

pub fn admin_remote_info() -> Arc<RemoteInfo> {
    Arc::clone(&ADMIN_INFO)
}

pub fn completion_remote_info() -> Arc<RemoteInfo> {
    Arc::clone(&COMPLETION_INFO)
}

/// Typed wrapper over the peer's admin stub.
#[derive(Clone)]
pub struct AdminStub {
    stub: Arc<Stub>,
}

impl AdminStub {
    pub fn new(stub: Arc<Stub>) -> Self {
        Self {
            stub,
        }
    }

    pub fn raw(&self) -> &Arc<Stub> {
        &self.stub
    }

    pub async fn set_remote_server(&self, value: Value) -> Result<(), RemoteError> {
        self.stub.call_async(SET_REMOTE_SERVER, vec![value]).await
    }

    pub async fn get_remote_info(
        &self,
        type_id: IdentBytes,
    ) -> Result<Arc<RemoteInfo>, RemoteError> {
        let reply = self
            .stub
            .call(
                GET_REMOTE_INFO,
                vec![Value::Bytes(Bytes::copy_from_slice(&type_id))],
            )
            .await?;
        let Value::Bytes(encoded) = reply else {
            return Err(RemoteError::Marshal(
                "peer returned a non-descriptor for get_remote_info".to_string(),
            ));
        };
        let mut slice: &[u8] = &encoded;
        let info = RemoteInfo::decode_from(&mut slice)
            .map_err(|e| RemoteError::Marshal(e.to_string()))?;
        Ok(Arc::new(info))
    }

    pub async fn disposed(&self, id: IdentBytes) -> Result<(), RemoteError> {
        self.stub
            .call_async(DISPOSED, vec![Value::Bytes(Bytes::copy_from_slice(&id))])
            .await
    }

    /// Ships a buffer of collected identifiers as one batched call plus the
    /// terminator.
    pub async fn disposed_batch(&self, ids: &[IdentBytes]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = Value::List(
            ids.iter()
                .map(|id| Value::Bytes(Bytes::copy_from_slice(id)))
                .collect(),
        );
        let mut batch = Batch::new();
        self.stub
            .call_batched(&mut batch, DISPOSED_BATCH, vec![list])
            .await?;
        let support = self.stub.support();
        support.flush_batch(&mut batch).await
    }

    pub async fn heartbeat(&self) -> Result<(), RemoteError> {
        self.stub.call_async(HEARTBEAT, vec![]).await
    }

    pub async fn closed(&self) -> Result<(), RemoteError> {
        self.stub.call_async(CLOSED, vec![]).await
    }

    pub async fn lookup(&self, name: &str) -> Result<Value, RemoteError> {
        self.stub.call(LOOKUP, vec![Value::string(name)]).await
    }
}

/// Encodes a descriptor for the `get_remote_info` reply.
pub fn encode_info(info: &RemoteInfo) -> Value {
    let mut buf = BytesMut::with_capacity(256);
    info.encode_to(&mut buf);
    Value::Bytes(buf.freeze())
}

/// Skeleton side of an asynchronous call's callback: feeds the local
/// completion and unexports itself after the peer's single invocation.
pub struct CompletionSkeleton {
    state: Arc<CompletionState>,
    anchor: Arc<dyn Any + Send + Sync>,
    id: OnceCell<VersionedIdentifier>,
    unexport: Box<dyn Fn(&IdentBytes) + Send + Sync>,
}

impl CompletionSkeleton {
    pub fn new(
        state: Arc<CompletionState>,
        unexport: Box<dyn Fn(&IdentBytes) + Send + Sync>,
    ) -> Self {
        Self {
            state,
            anchor: Arc::new(()),
            id: OnceCell::new(),
            unexport,
        }
    }

    pub fn bind(&self, id: VersionedIdentifier) {
        let _ = self.id.set(id);
    }
}

impl Skeleton for CompletionSkeleton {
    fn info(&self) -> Arc<RemoteInfo> {
        completion_remote_info()
    }

    fn target(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.anchor)
    }

    fn invoke(
        &self,
        selector: u32,
        mut args: Vec<Value>,
    ) -> BoxFut<'static, Result<Value, WireThrowable>> {
        let state = Arc::clone(&self.state);
        let id = self.id.get().copied();
        let payload = if args.is_empty() {
            Value::Null
        } else {
            args.swap_remove(0)
        };
        // One callback releases both sides: settle, then unexport.
        if let Some(id) = id {
            (self.unexport)(&id.key());
        }
        Box::pin(async move {
            match selector {
                COMPLETION_COMPLETE => {
                    state.complete(payload);
                    Ok(Value::Null)
                },
                COMPLETION_FAIL => {
                    match payload {
                        Value::Throwable(t) => state.fail(*t),
                        other => state.fail(WireThrowable::new(
                            "RemoteException",
                            format!("asynchronous call failed: {other:?}"),
                        )),
                    }
                    Ok(Value::Null)
                },
                other => Err(crate::session::skeleton::no_such_method(other)),
            }
        })
    }
}

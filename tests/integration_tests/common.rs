// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared fixture: an echo service exercising every dispatch mode.

use std::{
    any::Any,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use once_cell::sync::{Lazy, OnceCell};
use rmi_session_rs::{
    cfg::config::Config,
    codec::{
        throwable::{DISPATCH_MARKER_FILE, StackFrame, WireThrowable},
        value::{LocalRemote, Value},
    },
    error::RemoteError,
    remote::info::{MethodFlags, MethodInfo, RemoteInfo, TypeTag},
    session::{
        BoxFut, Exports, Session,
        skeleton::{Skeleton, SkeletonFactory, StubFactory, no_such_method, target_as},
        stub::{Pipe, Stub},
    },
    transport::mem::MemoryTransport,
};

pub const ECHO: u32 = 0;
pub const SLEEPY: u32 = 1;
pub const BOOM: u32 = 2;
pub const POKE: u32 = 3;
pub const COMPUTE: u32 = 4;
pub const NEW_CHILD: u32 = 5;
pub const TAG: u32 = 6;
pub const LAST_TAGS: u32 = 7;
pub const SELF_CHILD: u32 = 8;
pub const PIPE_ECHO: u32 = 9;
pub const BYE: u32 = 10;

static ECHO_INFO: Lazy<Arc<RemoteInfo>> = Lazy::new(|| {
    Arc::new(
        RemoteInfo::builder("test.EchoService")
            .method(
                MethodInfo::new("echo")
                    .param(TypeTag::Str)
                    .returns(TypeTag::Str),
            )
            .method(
                MethodInfo::new("sleepy")
                    .param(TypeTag::I64)
                    .returns(TypeTag::Str),
            )
            .method(MethodInfo::new("boom").throws("AException"))
            .method(MethodInfo::new("poke").flag(MethodFlags::ASYNCHRONOUS))
            .method(
                MethodInfo::new("compute")
                    .param(TypeTag::I32)
                    .returns(TypeTag::I32)
                    .flag(MethodFlags::ASYNCHRONOUS | MethodFlags::COMPLETION),
            )
            .method(
                MethodInfo::new("new_child")
                    .returns(TypeTag::Remote)
                    .flag(MethodFlags::BATCHED),
            )
            .method(
                MethodInfo::new("tag")
                    .param(TypeTag::Str)
                    .flag(MethodFlags::BATCHED),
            )
            .method(MethodInfo::new("last_tags").returns(TypeTag::Str))
            .method(MethodInfo::new("self_child").returns(TypeTag::Remote))
            .method(MethodInfo::new("pipe_echo").flag(MethodFlags::PIPE))
            .method(MethodInfo::new("bye").flag(MethodFlags::DISPOSER))
            .build(),
    )
});

pub fn echo_info() -> Arc<RemoteInfo> {
    Arc::clone(&ECHO_INFO)
}

pub struct EchoService {
    pub pokes: AtomicU32,
    tags: Mutex<Vec<String>>,
    stable_child: OnceCell<Arc<EchoService>>,
}

impl EchoService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pokes: AtomicU32::new(0),
            tags: Mutex::new(Vec::new()),
            stable_child: OnceCell::new(),
        })
    }

    fn push_tag(&self, tag: String) {
        self.tags.lock().expect("tags poisoned").push(tag);
    }

    fn joined_tags(&self) -> String {
        self.tags.lock().expect("tags poisoned").join(",")
    }
}

pub struct EchoSkeleton {
    target: Arc<EchoService>,
}

impl Skeleton for EchoSkeleton {
    fn info(&self) -> Arc<RemoteInfo> {
        echo_info()
    }

    fn target(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.target) as Arc<dyn Any + Send + Sync>
    }

    fn invoke(
        &self,
        selector: u32,
        mut args: Vec<Value>,
    ) -> BoxFut<'static, Result<Value, WireThrowable>> {
        let target = Arc::clone(&self.target);
        let arg = if args.is_empty() {
            Value::Null
        } else {
            args.swap_remove(0)
        };
        Box::pin(async move {
            match selector {
                ECHO => match arg {
                    Value::Str(s) => Ok(Value::Str(s)),
                    other => Err(WireThrowable::new(
                        "MarshalException",
                        format!("echo expects a string, got {other:?}"),
                    )),
                },
                SLEEPY => {
                    let millis = arg.as_i64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis as u64)).await;
                    Ok(Value::string("done"))
                },
                BOOM => Err(WireThrowable::new("AException", "outer failed")
                    .with_frames(vec![
                        StackFrame::new("boom", "echo_service.rs", 21),
                        StackFrame::new("dispatch", DISPATCH_MARKER_FILE, 3),
                    ])
                    .caused_by(WireThrowable::new("BException", "middle failed"))
                    .caused_by(WireThrowable::new("CException", "root failed"))),
                POKE => {
                    target.pokes.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                },
                COMPUTE => {
                    let v = arg.as_i32().unwrap_or(0);
                    Ok(Value::I32(v * 2))
                },
                NEW_CHILD => Ok(Value::Remote(
                    rmi_session_rs::codec::value::RemoteRef::Local(LocalRemote::new(
                        EchoService::new(),
                        echo_info(),
                    )),
                )),
                TAG => match arg {
                    Value::Str(s) if s == "fail" => Err(WireThrowable::new(
                        "TagException",
                        "refusing to record tag",
                    )),
                    Value::Str(s) => {
                        target.push_tag(s);
                        Ok(Value::Null)
                    },
                    other => Err(WireThrowable::new(
                        "MarshalException",
                        format!("tag expects a string, got {other:?}"),
                    )),
                },
                LAST_TAGS => Ok(Value::string(target.joined_tags())),
                SELF_CHILD => {
                    let child = target
                        .stable_child
                        .get_or_init(EchoService::new)
                        .clone();
                    Ok(Value::Remote(
                        rmi_session_rs::codec::value::RemoteRef::Local(
                            LocalRemote::new(child, echo_info()),
                        ),
                    ))
                },
                BYE => Ok(Value::Null),
                other => Err(no_such_method(other)),
            }
        })
    }

    fn invoke_pipe(
        &self,
        selector: u32,
        _args: Vec<Value>,
        pipe: Pipe,
    ) -> BoxFut<'static, Result<(), WireThrowable>> {
        Box::pin(async move {
            let mut pipe = pipe;
            if selector != PIPE_ECHO {
                return Err(no_such_method(selector));
            }
            let value = pipe.read_value().await.map_err(|e| e.to_throwable())?;
            pipe.write_value(&value).await.map_err(|e| e.to_throwable())?;
            pipe.flush().await.map_err(|e| e.to_throwable())?;
            pipe.close().await.map_err(|e| e.to_throwable())?;
            Ok(())
        })
    }
}

pub struct EchoSkeletonFactory;

impl SkeletonFactory for EchoSkeletonFactory {
    fn create(
        &self,
        target: Arc<dyn Any + Send + Sync>,
    ) -> Result<Arc<dyn Skeleton>, RemoteError> {
        let target = target_as::<EchoService>(&target)
            .map_err(|t| RemoteError::Marshal(t.to_string()))?;
        Ok(Arc::new(EchoSkeleton {
            target,
        }))
    }
}

/// Typed proxy. Holds the raw stub weakly: the stub caches this wrapper, so
/// a strong reference would leak the pair and break reclamation.
pub struct EchoClient {
    raw: Weak<Stub>,
}

impl EchoClient {
    fn stub(&self) -> Result<Arc<Stub>, RemoteError> {
        self.raw.upgrade().ok_or(RemoteError::SessionClosed)
    }

    pub async fn echo(&self, s: &str) -> Result<String, RemoteError> {
        let reply = self.stub()?.call(ECHO, vec![Value::string(s)]).await?;
        reply
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Marshal("echo reply is not a string".into()))
    }
}

pub struct EchoStubFactory;

impl StubFactory for EchoStubFactory {
    fn create(&self, raw: &Arc<Stub>) -> Arc<dyn Any + Send + Sync> {
        Arc::new(EchoClient {
            raw: Arc::downgrade(raw),
        })
    }
}

pub fn test_config(heartbeat_ms: u64) -> Config {
    let mut cfg = Config::default();
    cfg.session.heartbeat = Duration::from_millis(heartbeat_ms);
    cfg.session.io_timeout = Duration::from_secs(5);
    cfg.validate_and_normalize().expect("test config is valid");
    cfg
}

pub fn echo_exports(service: Arc<EchoService>) -> Exports {
    Exports::new()
        .register_type(
            echo_info(),
            Some(Arc::new(EchoStubFactory)),
            Some(Arc::new(EchoSkeletonFactory)),
        )
        .export("echo", LocalRemote::new(service, echo_info()))
}

pub fn plain_exports() -> Exports {
    Exports::new().register_type(
        echo_info(),
        Some(Arc::new(EchoStubFactory)),
        Some(Arc::new(EchoSkeletonFactory)),
    )
}

/// Connects two sessions over an in-memory transport pair.
pub async fn session_pair(
    cfg_left: Config,
    cfg_right: Config,
    exports_left: Exports,
    exports_right: Exports,
) -> Result<(Session<MemoryTransport>, Session<MemoryTransport>)> {
    let (left, right) = MemoryTransport::pair();
    let (left, right) = tokio::try_join!(
        Session::connect(left, cfg_left, exports_left),
        Session::connect(right, cfg_right, exports_right),
    )?;
    Ok((left, right))
}

/// Server exporting an echo service plus a plain client peer.
pub async fn echo_pair(
    heartbeat_ms: u64,
) -> Result<(
    Arc<EchoService>,
    Session<MemoryTransport>,
    Session<MemoryTransport>,
    Arc<Stub>,
)> {
    let service = EchoService::new();
    let (server, client) = session_pair(
        test_config(heartbeat_ms),
        test_config(heartbeat_ms),
        echo_exports(Arc::clone(&service)),
        plain_exports(),
    )
    .await?;
    let stub = client
        .lookup("echo")
        .await?
        .expect("echo service is exported");
    Ok((service, server, client, stub))
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The top-level session object.
//!
//! A session owns the channel pool, both identifier registries, the peer
//! admin proxy, the heartbeat clock and the accept loop. The handshake runs
//! its open and accept halves concurrently so neither peer deadlocks
//! waiting for the other's admin reference.
//!
//! Accepted channels are served by per-channel reader tasks: a reader
//! decodes one request, and for asynchronous methods hands the body to the
//! worker pool before reading the next request, so a long call never blocks
//! the channel head-of-line.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashSet;
use once_cell::sync::OnceCell;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::{Config, ProcessFlags, process_flags},
    channel::{Channel, ChannelError, pool::ChannelPool},
    codec::{
        Status,
        input::InvocationInput,
        output::InvocationOutput,
        throwable::WireThrowable,
        value::{LocalRemote, MarshalledRemote, RemoteRef, Value},
    },
    error::RemoteError,
    ident::{IdentBytes, VersionedIdentifier, registry::ObjectRegistry},
    remote::{
        completion::Completion,
        info::{MethodFlags, RemoteInfo, TypeTag},
    },
    scheduler::{Scheduler, TaskHandle, task::{FixedRate, OneShot, Period}},
    session::{
        BoxFut, Exports,
        admin::{
            self, AdminStub, CompletionSkeleton, admin_remote_info,
            completion_remote_info, encode_info,
        },
        reclaim::{self, ReclaimQueue},
        skeleton::{Skeleton, no_such_method},
        stub::{Batch, DisposedSupport, Pipe, PipeHome, Stub, StubSupport, map_channel_err},
    },
    transport::Transport,
};

enum SharedSlot {
    Empty,
    Set(Option<Value>),
}

pub(crate) struct SessionCore<T: Transport> {
    cfg: Config,
    flags: ProcessFlags,
    transport: T,
    scheduler: Scheduler,
    pool: ChannelPool,
    registry: ObjectRegistry,
    admin_id: VersionedIdentifier,
    /// Cleared on close to break the session → admin stub → session cycle.
    peer_admin: Mutex<Option<AdminStub>>,
    shared: Mutex<SharedSlot>,
    shared_notify: Notify,
    closing: AtomicBool,
    epoch: Instant,
    /// Peer must have sent a heartbeat by this instant (nanos from epoch).
    next_expected_heartbeat: AtomicU64,
    /// We must send our next heartbeat by this instant (nanos from epoch).
    next_heartbeat_due: AtomicU64,
    reclaim_tx: tokio::sync::mpsc::UnboundedSender<IdentBytes>,
    /// Cancelled when the session reaches closing; stops long-running
    /// background tasks (acceptor, reclaimer).
    lifecycle: tokio_util::sync::CancellationToken,
    sent_infos: DashSet<IdentBytes>,
    self_weak: OnceCell<Weak<SessionCore<T>>>,
    local_addr: String,
    remote_addr: String,
}

impl<T: Transport> SessionCore<T> {
    fn build(transport: T, cfg: Config) -> (Arc<Self>, ReclaimQueue) {
        let flags = process_flags().clone();
        let scheduler = Scheduler::new(
            cfg.scheduler.workers as usize,
            flags.saturation_dump,
            flags.saturation_exit,
        );
        let pool = ChannelPool::new(
            cfg.channels.pool_cap as usize,
            cfg.session.io_timeout,
        );
        let registry = ObjectRegistry::new();
        registry.register_type(admin_remote_info(), None, None);
        registry.register_type(completion_remote_info(), None, None);

        let queue = ReclaimQueue::new();
        let local_addr = transport.local_address().to_string();
        let remote_addr = transport.remote_address().to_string();

        let core = Arc::new(Self {
            cfg,
            flags,
            transport,
            scheduler,
            pool,
            registry,
            admin_id: VersionedIdentifier::mint(),
            peer_admin: Mutex::new(None),
            shared: Mutex::new(SharedSlot::Empty),
            shared_notify: Notify::new(),
            closing: AtomicBool::new(false),
            epoch: Instant::now(),
            next_expected_heartbeat: AtomicU64::new(u64::MAX),
            next_heartbeat_due: AtomicU64::new(0),
            reclaim_tx: queue.tx.clone(),
            lifecycle: tokio_util::sync::CancellationToken::new(),
            sent_infos: DashSet::new(),
            self_weak: OnceCell::new(),
            local_addr,
            remote_addr,
        });
        let _ = core.self_weak.set(Arc::downgrade(&core));

        let admin_skeleton = Arc::new(AdminSkeleton {
            core: Arc::downgrade(&core),
            anchor: Arc::new(()),
        });
        core.registry.register_skeleton(core.admin_id, admin_skeleton);

        (core, queue)
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn heartbeat(&self) -> Duration {
        self.cfg.session.heartbeat
    }

    fn as_arc(&self) -> Arc<Self> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("session core self reference lost")
    }

    fn as_support(&self) -> Arc<dyn StubSupport> {
        self.as_arc()
    }

    fn peer_admin_stub(&self) -> Result<AdminStub, RemoteError> {
        self.peer_admin
            .lock()
            .expect("peer admin poisoned")
            .clone()
            .ok_or(RemoteError::SessionClosed)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn touch_peer_heartbeat(&self) {
        let due = self
            .now_nanos()
            .saturating_add(self.heartbeat().as_nanos() as u64);
        self.next_expected_heartbeat.store(due, Ordering::SeqCst);
    }

    async fn acquire_channel(&self) -> Result<Channel, RemoteError> {
        if self.pool.is_closed() {
            return Err(RemoteError::SessionClosed);
        }
        if let Some(ch) = self.pool.pop_idle() {
            return Ok(ch);
        }
        let stream = self
            .transport
            .open()
            .await
            .map_err(|e| self.map_failure(RemoteError::TransportClosed(e.to_string())))?;
        Ok(self.pool.adopt(stream))
    }

    fn map_failure(&self, cause: RemoteError) -> RemoteError {
        if self.is_closing() {
            RemoteError::SessionClosed
        } else {
            cause
        }
    }

    fn spawn_reader(&self, ch: Channel) {
        let core = self.as_arc();
        tokio::spawn(run_reader(core, ch));
    }

    // ---- handshake ----

    async fn handshake_open(&self) -> Result<(), RemoteError> {
        let stream = self
            .transport
            .open()
            .await
            .map_err(|e| RemoteError::TransportClosed(e.to_string()))?;
        let mut ch = self.pool.adopt(stream);
        let marshalled = MarshalledRemote {
            id: self.admin_id,
            type_id: admin_remote_info().type_id(),
            info: None,
        };
        let outcome = async {
            let mut out = InvocationOutput::new(&mut ch);
            out.write_value(&Value::Remote(RemoteRef::Marshalled(marshalled)))
                .await?;
            out.flush().await
        }
        .await;
        match outcome {
            Ok(()) => {
                self.pool.release(ch, true);
                Ok(())
            },
            Err(e) => {
                self.pool.discard(ch);
                Err(map_channel_err(e))
            },
        }
    }

    async fn handshake_accept(&self) -> Result<(), RemoteError> {
        let stream = self
            .transport
            .accept()
            .await
            .map_err(|e| RemoteError::TransportClosed(e.to_string()))?;
        let mut ch = self.pool.adopt(stream);
        let value = {
            let mut inp = InvocationInput::new(&mut ch);
            inp.read_value().await.map_err(map_channel_err)?
        };
        let Value::Remote(RemoteRef::Marshalled(m)) = value else {
            self.pool.discard(ch);
            return Err(RemoteError::Marshal(
                "handshake did not carry the peer admin".to_string(),
            ));
        };
        let support = self.as_support();
        let peer = self.registry.register_stub(m.id, || {
            Ok(Arc::new(Stub::new(
                m.id,
                m.type_id,
                admin_remote_info(),
                support,
                None,
            )))
        })?;
        *self.peer_admin.lock().expect("peer admin poisoned") =
            Some(AdminStub::new(peer));
        self.spawn_reader(ch);
        Ok(())
    }

    // ---- clock ----

    fn start_clock(&self) -> Result<(), RemoteError> {
        let half = self.heartbeat() / 2;
        let weak = Arc::downgrade(&self.as_arc());
        self.scheduler.schedule_fn(
            half,
            Period::FixedRate(FixedRate {
                period: half,
            }),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.heartbeat_send().await;
                    }
                }
            },
        )?;
        let weak = Arc::downgrade(&self.as_arc());
        self.scheduler.schedule_fn(
            half,
            Period::FixedRate(FixedRate {
                period: half,
            }),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.heartbeat_check().await;
                    }
                }
            },
        )?;
        Ok(())
    }

    async fn heartbeat_send(&self) {
        if self.is_closing() {
            return;
        }
        self.next_heartbeat_due.store(
            self.now_nanos()
                .saturating_add((self.heartbeat() / 2).as_nanos() as u64),
            Ordering::SeqCst,
        );
        if let Ok(admin) = self.peer_admin_stub() {
            if let Err(e) = admin.heartbeat().await {
                debug!("heartbeat send failed: {e}");
            }
        }
    }

    async fn heartbeat_check(&self) {
        if self.is_closing() {
            return;
        }
        if self.now_nanos() > self.next_expected_heartbeat.load(Ordering::SeqCst) {
            warn!(
                peer = %self.remote_addr,
                "peer heartbeat overdue, closing session"
            );
            self.close_internal(true).await;
        }
    }

    // ---- shared object slot ----

    fn deposit_shared(&self, value: Value) {
        let mut slot = self.shared.lock().expect("shared slot poisoned");
        if matches!(*slot, SharedSlot::Empty) {
            *slot = SharedSlot::Set(if value.is_null() {
                None
            } else {
                Some(value)
            });
        }
        drop(slot);
        self.shared_notify.notify_waiters();
    }

    async fn receive_shared(&self) -> Result<Option<Value>, RemoteError> {
        loop {
            let notified = self.shared_notify.notified();
            tokio::pin!(notified);
            // Register before the probe so a deposit racing in between still
            // wakes this waiter.
            notified.as_mut().enable();
            {
                let slot = self.shared.lock().expect("shared slot poisoned");
                if let SharedSlot::Set(v) = &*slot {
                    return Ok(v.clone());
                }
            }
            if self.is_closing() {
                return Err(RemoteError::SessionClosed);
            }
            notified.await;
        }
    }

    // ---- marshalling hooks ----

    fn prepare_value(&self, value: Value) -> Result<Value, RemoteError> {
        Ok(match value {
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.prepare_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Remote(RemoteRef::Local(lr)) => self.marshal_local(&lr)?,
            Value::Throwable(mut t) => {
                t.stamp(&self.local_addr, &self.remote_addr);
                if self.flags.prune_stack_traces {
                    t.prune();
                }
                Value::Throwable(t)
            },
            other => other,
        })
    }

    fn marshal_local(&self, lr: &LocalRemote) -> Result<Value, RemoteError> {
        let id = self.registry.identify(lr)?;
        let type_id = lr.info.type_id();
        let info = if self.sent_infos.insert(type_id) {
            Some(Arc::clone(&lr.info))
        } else {
            None
        };
        Ok(Value::Remote(RemoteRef::Marshalled(MarshalledRemote {
            id,
            type_id,
            info,
        })))
    }

    async fn resolve(&self, value: Value) -> Result<Value, RemoteError> {
        match value {
            Value::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(Box::pin(self.resolve(item)).await?);
                }
                Ok(Value::List(resolved))
            },
            Value::Remote(RemoteRef::Marshalled(m)) => self.resolve_marshalled(m).await,
            other => Ok(other),
        }
    }

    async fn resolve_marshalled(
        &self,
        m: MarshalledRemote,
    ) -> Result<Value, RemoteError> {
        // A version bump means the peer re-bound the identifier: the cached
        // stub describes the old binding, so force a fresh one.
        if self
            .registry
            .update_remote_version(m.id.key(), m.id.local_version)
        {
            self.registry.evict_stub(&m.id.key());
        }

        // Loopback: the identifier denotes a skeleton on this side.
        if let Some(entry) = self.registry.try_retrieve_skeleton(&m.id.key()) {
            return Ok(Value::Remote(RemoteRef::Local(LocalRemote {
                target: entry.skeleton.target(),
                info: entry.skeleton.info(),
            })));
        }

        let type_entry = match self.registry.type_by_id(&m.type_id) {
            Some(entry) => entry,
            None => match &m.info {
                Some(info) => self.registry.adopt_type(Arc::clone(info)),
                None => {
                    let admin = self.peer_admin_stub()?;
                    let info = admin.get_remote_info(m.type_id).await?;
                    self.registry.adopt_type(info)
                },
            },
        };

        let support = self.as_support();
        let reclaim = self.reclaim_tx.clone();
        let info = Arc::clone(&type_entry.info);
        let stub = self.registry.register_stub(m.id, move || {
            Ok(Arc::new(Stub::new(
                m.id,
                m.type_id,
                info,
                support,
                Some(reclaim),
            )))
        })?;
        if stub.typed().is_none()
            && let Some(factory) = &type_entry.stub_factory
        {
            stub.set_typed(factory.create(&stub));
        }
        Ok(Value::Remote(RemoteRef::Stub(stub)))
    }

    // ---- exports / admin backing ----

    fn export_named(&self, name: &str, obj: &LocalRemote) -> Result<(), RemoteError> {
        self.registry.identify(obj)?;
        self.registry.export_name(name, obj.clone());
        Ok(())
    }

    fn lookup_local(&self, name: &str) -> Result<Value, WireThrowable> {
        let Some(local) = self.registry.lookup_name(name) else {
            return Ok(Value::Null);
        };
        // identify() re-binds when a peer disposal removed the skeleton.
        self.marshal_local(&local)
            .map_err(|e| e.to_throwable())
    }

    fn unexport(&self, key: &IdentBytes) {
        if let Some((type_id, evicted)) = self.registry.remove_skeleton(key)
            && evicted
        {
            self.sent_infos.remove(&type_id);
        }
    }

    /// Binds a batched call's result under the tentative identifier the
    /// caller assigned optimistically.
    fn bind_tentative(
        &self,
        value: Value,
        tentative: IdentBytes,
    ) -> Result<(), WireThrowable> {
        let Value::Remote(RemoteRef::Local(lr)) = value else {
            return Err(WireThrowable::new(
                "MarshalException",
                "batched result is not a local remote",
            ));
        };
        let factory = self
            .registry
            .type_by_name(&lr.info.name)
            .and_then(|e| e.skeleton_factory.clone())
            .ok_or_else(|| {
                WireThrowable::new(
                    "MarshalException",
                    format!("no skeleton factory registered for {}", lr.info.name),
                )
            })?;
        let skeleton = factory
            .create(Arc::clone(&lr.target))
            .map_err(|e| e.to_throwable())?;
        self.registry
            .register_skeleton(VersionedIdentifier::from_bytes(tentative), skeleton);
        Ok(())
    }

    // ---- close ----

    async fn close_internal(&self, notify_peer: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            local = %self.local_addr,
            peer = %self.remote_addr,
            "closing session"
        );
        let peer = self
            .peer_admin
            .lock()
            .expect("peer admin poisoned")
            .take();
        if notify_peer && let Some(adminref) = &peer {
            if let Err(e) = adminref.closed().await {
                debug!("close notification failed: {e}");
            }
        }
        drop(peer);
        self.lifecycle.cancel();
        self.scheduler.shutdown();
        self.pool.close();
        self.registry.clear_skeletons();
        self.transport.close();
        self.shared_notify.notify_waiters();
    }
}

// ---- admin skeleton ----

struct AdminSkeleton<T: Transport> {
    core: Weak<SessionCore<T>>,
    anchor: Arc<dyn std::any::Any + Send + Sync>,
}

impl<T: Transport> Skeleton for AdminSkeleton<T> {
    fn info(&self) -> Arc<RemoteInfo> {
        admin_remote_info()
    }

    fn target(&self) -> Arc<dyn std::any::Any + Send + Sync> {
        Arc::clone(&self.anchor)
    }

    fn invoke(
        &self,
        selector: u32,
        mut args: Vec<Value>,
    ) -> BoxFut<'static, Result<Value, WireThrowable>> {
        let core = self.core.clone();
        Box::pin(async move {
            let Some(core) = core.upgrade() else {
                return Err(WireThrowable::new(
                    "SessionClosedException",
                    "session closed",
                ));
            };
            let arg = |args: &mut Vec<Value>| -> Value {
                if args.is_empty() {
                    Value::Null
                } else {
                    args.swap_remove(0)
                }
            };
            match selector {
                admin::SET_REMOTE_SERVER => {
                    core.deposit_shared(arg(&mut args));
                    Ok(Value::Null)
                },
                admin::GET_REMOTE_INFO => {
                    let Value::Bytes(raw) = arg(&mut args) else {
                        return Err(WireThrowable::new(
                            "MarshalException",
                            "get_remote_info expects a type identifier",
                        ));
                    };
                    let mut type_id: IdentBytes = [0u8; 16];
                    if raw.len() != 16 {
                        return Err(WireThrowable::new(
                            "MarshalException",
                            "type identifier must be 16 bytes",
                        ));
                    }
                    type_id.copy_from_slice(&raw);
                    match core.registry.type_by_id(&type_id) {
                        Some(entry) => Ok(encode_info(&entry.info)),
                        None => Err(WireThrowable::new(
                            "NoSuchTypeException",
                            format!("unknown type {}", hex::encode(type_id)),
                        )),
                    }
                },
                admin::DISPOSED => {
                    if let Value::Bytes(raw) = arg(&mut args)
                        && raw.len() == 16
                    {
                        let mut key: IdentBytes = [0u8; 16];
                        key.copy_from_slice(&raw);
                        core.unexport(&key);
                    }
                    Ok(Value::Null)
                },
                admin::DISPOSED_BATCH => {
                    if let Value::List(ids) = arg(&mut args) {
                        for id in ids {
                            if let Value::Bytes(raw) = id
                                && raw.len() == 16
                            {
                                let mut key: IdentBytes = [0u8; 16];
                                key.copy_from_slice(&raw);
                                core.unexport(&key);
                            }
                        }
                    }
                    Ok(Value::Null)
                },
                admin::HEARTBEAT => Ok(Value::Null),
                admin::CLOSED => {
                    debug!("peer announced close");
                    core.close_internal(false).await;
                    Ok(Value::Null)
                },
                admin::SYNC => Ok(Value::Null),
                admin::LOOKUP => {
                    let name = match arg(&mut args) {
                        Value::Str(s) => s,
                        _ => {
                            return Err(WireThrowable::new(
                                "MarshalException",
                                "lookup expects a name",
                            ));
                        },
                    };
                    core.lookup_local(&name)
                },
                other => Err(no_such_method(other)),
            }
        })
    }
}

// ---- stub support ----

impl<T: Transport> StubSupport for SessionCore<T> {
    fn session_addresses(&self) -> (String, String) {
        (self.local_addr.clone(), self.remote_addr.clone())
    }

    fn is_session_closed(&self) -> bool {
        self.is_closing()
    }

    fn prepare_args(&self, args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        args.into_iter().map(|v| self.prepare_value(v)).collect()
    }

    fn resolve_value(&self, value: Value) -> BoxFut<'_, Result<Value, RemoteError>> {
        Box::pin(self.resolve(value))
    }

    fn invoke(
        &self,
        id: VersionedIdentifier,
    ) -> BoxFut<'_, Result<Channel, RemoteError>> {
        Box::pin(async move {
            let mut ch = self.acquire_channel().await?;
            let mut out = InvocationOutput::new(&mut ch);
            match out.write_identifier(&id).await {
                Ok(()) => Ok(ch),
                Err(e) => {
                    let cause = map_channel_err(e);
                    self.pool.discard(ch);
                    Err(self.map_failure(cause))
                },
            }
        })
    }

    fn schedule_timeout(
        &self,
        ch: &Channel,
        timeout: Duration,
    ) -> Result<TaskHandle, RemoteError> {
        let token = ch.cancel_token();
        self.scheduler.schedule_fn(
            timeout,
            Period::OneShot(OneShot),
            move || {
                let token = token.clone();
                async move {
                    debug!("call timeout fired, closing channel");
                    token.cancel();
                }
            },
        )
    }

    fn finished(&self, ch: Channel, reset: bool) {
        self.pool.release(ch, reset);
    }

    fn finished_and_cancel_timeout(
        &self,
        ch: Channel,
        reset: bool,
        timeout: TaskHandle,
    ) -> bool {
        let in_time = timeout.cancel();
        self.pool.release(ch, reset);
        in_time
    }

    fn failed(&self, ch: Channel, cause: RemoteError) -> RemoteError {
        self.pool.discard(ch);
        self.map_failure(cause)
    }

    fn failed_and_cancel_timeout(
        &self,
        ch: Channel,
        cause: RemoteError,
        timeout: TaskHandle,
        budget: Duration,
    ) -> RemoteError {
        let in_time = timeout.cancel();
        self.pool.discard(ch);
        if !in_time {
            return RemoteError::Timeout(budget);
        }
        self.map_failure(cause)
    }

    fn batched(&self, batch: &mut Batch, ch: Channel) {
        batch.pin(ch);
    }

    fn batched_and_cancel_timeout(
        &self,
        batch: &mut Batch,
        ch: Channel,
        timeout: TaskHandle,
    ) -> bool {
        let in_time = timeout.cancel();
        batch.pin(ch);
        in_time
    }

    fn unbatch(&self, batch: &mut Batch) -> Option<Channel> {
        batch.take_channel()
    }

    fn rebatch(&self, batch: &mut Batch, ch: Option<Channel>) {
        if let Some(ch) = ch {
            batch.pin(ch);
        }
    }

    fn release(&self, ch: Channel) -> Pipe {
        Pipe::new(ch, self.as_support(), PipeHome::Pool)
    }

    fn recycle_pipe(&self, ch: Channel, home: PipeHome) {
        match home {
            PipeHome::Pool => self.pool.release(ch, true),
            PipeHome::Reader => self.spawn_reader(ch),
        }
    }

    fn create_completion(&self) -> Result<(Completion, Value), RemoteError> {
        if self.is_closing() {
            return Err(RemoteError::SessionClosed);
        }
        let completion = Completion::new();
        let weak = Arc::downgrade(&self.as_arc());
        let skeleton = Arc::new(CompletionSkeleton::new(
            completion.state(),
            Box::new(move |key| {
                if let Some(core) = weak.upgrade() {
                    core.unexport(key);
                }
            }),
        ));
        let bound = self
            .registry
            .register_skeleton(VersionedIdentifier::mint(), Arc::clone(&skeleton) as Arc<dyn Skeleton>);
        skeleton.bind(bound);
        let callback = Value::Remote(RemoteRef::Marshalled(MarshalledRemote {
            id: bound,
            type_id: completion_remote_info().type_id(),
            info: None,
        }));
        Ok((completion, callback))
    }

    fn create_batched_remote(
        &self,
        info: Arc<RemoteInfo>,
    ) -> Result<(Arc<Stub>, VersionedIdentifier), RemoteError> {
        if self.is_closing() {
            return Err(RemoteError::SessionClosed);
        }
        let tentative = VersionedIdentifier::mint();
        let support = self.as_support();
        let reclaim = self.reclaim_tx.clone();
        let type_id = info.type_id();
        let stub_info = Arc::clone(&info);
        let stub = self.registry.register_stub(tentative, move || {
            Ok(Arc::new(Stub::new(
                tentative,
                type_id,
                stub_info,
                support,
                Some(reclaim),
            )))
        })?;
        if stub.typed().is_none()
            && let Some(entry) = self.registry.type_by_name(&info.name)
            && let Some(factory) = &entry.stub_factory
        {
            stub.set_typed(factory.create(&stub));
        }
        Ok((stub, tentative))
    }

    fn flush_batch<'a>(
        &'a self,
        batch: &'a mut Batch,
    ) -> BoxFut<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let Some(mut ch) = batch.take_channel() else {
                return Ok(());
            };
            let admin = match self.peer_admin_stub() {
                Ok(admin) => admin,
                Err(e) => {
                    batch.fail_all(&e.to_throwable());
                    self.pool.discard(ch);
                    return Err(e);
                },
            };
            let outcome = async {
                let mut out = InvocationOutput::new(&mut ch);
                out.write_identifier(&admin.raw().identifier()).await?;
                out.write_varuint(admin::SYNC).await?;
                out.write_value(&Value::List(Vec::new())).await?;
                out.flush().await?;
                let mut inp = InvocationInput::new(&mut ch);
                match inp.read_status().await? {
                    Status::Throwable => Ok(Some(inp.read_throwable().await?)),
                    Status::Ok => {
                        let _ = inp.read_value().await?;
                        Ok(None)
                    },
                    Status::BatchAck => Ok(None),
                }
            }
            .await;
            match outcome {
                Ok(None) => {
                    batch.complete_all();
                    self.pool.release(ch, true);
                    Ok(())
                },
                Ok(Some(throwable)) => {
                    batch.fail_all(&throwable);
                    self.pool.release(ch, true);
                    Err(RemoteError::Peer(Box::new(throwable)))
                },
                Err(e) => {
                    let cause = self.map_failure(map_channel_err(e));
                    batch.fail_all(&cause.to_throwable());
                    self.pool.discard(ch);
                    Err(cause)
                },
            }
        })
    }

    fn dispose_support(&self, id: VersionedIdentifier) -> Arc<dyn StubSupport> {
        Arc::new(DisposedSupport {
            id,
            local: self.local_addr.clone(),
            remote: self.remote_addr.clone(),
        })
    }
}

// ---- reader / acceptor ----

struct QueuedCall {
    skeleton: Arc<dyn Skeleton>,
    id: IdentBytes,
    selector: u32,
    args: Vec<Value>,
    flags: MethodFlags,
    tentative: Option<IdentBytes>,
}

async fn run_reader<T: Transport>(core: Arc<SessionCore<T>>, mut ch: Channel) {
    let mut queue: Vec<QueuedCall> = Vec::new();
    loop {
        if core.is_closing() {
            core.pool.discard(ch);
            return;
        }
        match ch.await_chunk().await {
            Ok(()) => {},
            Err(e) => {
                if !matches!(e, ChannelError::Cancelled) {
                    debug!("reader channel {} closed: {e}", ch.id());
                }
                core.pool.discard(ch);
                return;
            },
        }
        match serve_one(&core, &mut ch, &mut queue).await {
            Ok(ReaderVerdict::Continue) => {},
            Ok(ReaderVerdict::Detached) | Ok(ReaderVerdict::CloseChannel) | Err(_) => {
                // On detach `ch` is the dead placeholder left by the swap.
                core.pool.discard(ch);
                return;
            },
        }
    }
}

enum ReaderVerdict {
    Continue,
    /// The channel left the reader's custody (pipe mode).
    Detached,
    CloseChannel,
}

async fn serve_one<T: Transport>(
    core: &Arc<SessionCore<T>>,
    ch: &mut Channel,
    queue: &mut Vec<QueuedCall>,
) -> Result<ReaderVerdict, ChannelError> {
    let (id, selector, raw_args) = {
        let mut inp = InvocationInput::new(ch);
        let id = inp.read_identifier().await?;
        let selector = inp.read_varuint().await?;
        let args = inp.read_value().await?;
        (id, selector, args)
    };

    let is_admin = id == core.admin_id;
    if is_admin {
        core.touch_peer_heartbeat();
    }
    if core
        .registry
        .update_remote_version(id.key(), id.local_version)
    {
        core.registry.evict_stub(&id.key());
    }

    let Value::List(raw_args) = raw_args else {
        return Err(ChannelError::Codec(crate::codec::CodecError::Invalid(
            "request arguments must be a list".to_string(),
        )));
    };

    let Some(entry) = core.registry.try_retrieve_skeleton(&id.key()) else {
        // Unknown identifier: report and drop the channel.
        let gone = RemoteError::NoSuchObject(id);
        respond_throwable(core, ch, gone.to_throwable()).await?;
        return Ok(ReaderVerdict::CloseChannel);
    };

    let info = entry.skeleton.info();
    let Some(method) = info.method(selector) else {
        // Without the descriptor the remainder of the request cannot be
        // framed reliably, so the channel is sacrificed after the reply.
        respond_throwable(core, ch, no_such_method(selector)).await?;
        return Ok(ReaderVerdict::CloseChannel);
    };
    let flags = method.flags;

    let tentative = if flags.contains(MethodFlags::BATCHED)
        && method.returns == TypeTag::Remote
    {
        let mut inp = InvocationInput::new(ch);
        Some(inp.read_ident_bytes().await?)
    } else {
        None
    };

    let mut args = Vec::with_capacity(raw_args.len());
    for raw in raw_args {
        match core.resolve(raw).await {
            Ok(v) => args.push(v),
            Err(e) => {
                respond_throwable(core, ch, e.to_throwable()).await?;
                return Ok(ReaderVerdict::Continue);
            },
        }
    }

    if flags.contains(MethodFlags::BATCHED) {
        queue.push(QueuedCall {
            skeleton: entry.skeleton,
            id: id.key(),
            selector,
            args,
            flags,
            tentative,
        });
        return Ok(ReaderVerdict::Continue);
    }

    // A non-batched call closes any pending batch; a batched failure is
    // surfaced here and the closing call is skipped.
    if !queue.is_empty() {
        if let Err(throwable) = apply_batch(core, queue).await {
            respond_throwable(core, ch, throwable).await?;
            return Ok(ReaderVerdict::Continue);
        }
    }

    if flags.contains(MethodFlags::ASYNCHRONOUS) {
        // The channel goes back to reading before the body runs.
        let body = run_async_body(
            entry.skeleton,
            selector,
            args,
            flags.contains(MethodFlags::COMPLETION),
        );
        if core.scheduler.execute(body).is_err() {
            warn!("asynchronous dispatch rejected: worker pool saturated");
        }
        return Ok(ReaderVerdict::Continue);
    }

    if flags.contains(MethodFlags::PIPE) {
        let pipe = Pipe::new(
            core.pool_detach(ch)?,
            core.as_support(),
            PipeHome::Reader,
        );
        let fut = entry.skeleton.invoke_pipe(selector, args, pipe);
        if core
            .scheduler
            .execute(async move {
                if let Err(t) = fut.await {
                    debug!("pipe dispatch failed: {t}");
                }
            })
            .is_err()
        {
            warn!("pipe dispatch rejected: worker pool saturated");
        }
        return Ok(ReaderVerdict::Detached);
    }

    let outcome = entry.skeleton.invoke(selector, args).await;
    let dispose_after = outcome.is_ok() && flags.contains(MethodFlags::DISPOSER);
    let is_admin_sync = is_admin && selector == admin::SYNC;
    match outcome {
        Ok(_) if is_admin_sync => {
            let mut out = InvocationOutput::new(ch);
            out.write_status(Status::BatchAck).await?;
            out.flush().await?;
        },
        Ok(value) => match core.prepare_value(value) {
            Ok(prepared) => {
                let mut out = InvocationOutput::new(ch);
                out.write_status(Status::Ok).await?;
                out.write_value(&prepared).await?;
                out.flush().await?;
            },
            Err(e) => respond_throwable(core, ch, e.to_throwable()).await?,
        },
        Err(throwable) => respond_throwable(core, ch, throwable).await?,
    }
    if dispose_after {
        core.unexport(&id.key());
    }
    Ok(ReaderVerdict::Continue)
}

async fn respond_throwable<T: Transport>(
    core: &Arc<SessionCore<T>>,
    ch: &mut Channel,
    mut throwable: WireThrowable,
) -> Result<(), ChannelError> {
    throwable.stamp(&core.local_addr, &core.remote_addr);
    if core.flags.prune_stack_traces {
        throwable.prune();
    }
    let mut out = InvocationOutput::new(ch);
    out.write_status(Status::Throwable).await?;
    out.write_throwable(throwable).await?;
    out.flush().await
}

async fn apply_batch<T: Transport>(
    core: &Arc<SessionCore<T>>,
    queue: &mut Vec<QueuedCall>,
) -> Result<(), WireThrowable> {
    let calls = std::mem::take(queue);
    for call in calls {
        match call.skeleton.invoke(call.selector, call.args).await {
            Ok(value) => {
                if let Some(tentative) = call.tentative {
                    core.bind_tentative(value, tentative)?;
                }
                if call.flags.contains(MethodFlags::DISPOSER) {
                    core.unexport(&call.id);
                }
            },
            // Subsequent batched calls on this sequence are skipped.
            Err(throwable) => return Err(throwable),
        }
    }
    Ok(())
}

async fn run_async_body(
    skeleton: Arc<dyn Skeleton>,
    selector: u32,
    mut args: Vec<Value>,
    has_completion: bool,
) {
    let callback = if has_completion { args.pop() } else { None };
    let outcome = skeleton.invoke(selector, args).await;
    match callback {
        Some(Value::Remote(RemoteRef::Stub(cb))) => {
            let sent = match outcome {
                Ok(value) => cb.call_async(admin::COMPLETION_COMPLETE, vec![value]).await,
                Err(throwable) => {
                    cb.call_async(
                        admin::COMPLETION_FAIL,
                        vec![Value::Throwable(Box::new(throwable))],
                    )
                    .await
                },
            };
            if let Err(e) = sent {
                debug!("completion callback failed: {e}");
            }
        },
        _ => {
            if let Err(t) = outcome {
                debug!("asynchronous body failed: {t}");
            }
        },
    }
}

pub(crate) async fn run_acceptor<T: Transport>(core: Arc<SessionCore<T>>) {
    loop {
        if core.is_closing() {
            return;
        }
        match core.transport.accept().await {
            Ok(stream) => {
                let ch = core.pool.adopt(stream);
                core.spawn_reader(ch);
            },
            Err(e) => {
                if !core.is_closing() {
                    debug!("acceptor stopped: {e}");
                }
                return;
            },
        }
    }
}

impl<T: Transport> SessionCore<T> {
    /// Takes the reader's channel out of its stack slot for pipe handoff,
    /// leaving a dead placeholder the reader discards on its way out.
    fn pool_detach(&self, ch: &mut Channel) -> Result<Channel, ChannelError> {
        let (dead, other_half) = tokio::io::duplex(1);
        drop(other_half);
        let placeholder = self.pool.adopt(Box::new(dead));
        Ok(std::mem::replace(ch, placeholder))
    }
}

// ---- public surface ----

/// A bidirectional remote-method-invocation session over one transport.
pub struct Session<T: Transport> {
    core: Arc<SessionCore<T>>,
}

impl<T: Transport> Session<T> {
    /// Establishes a session: registers exports, runs both handshake halves
    /// concurrently, starts the heartbeat clock, the acceptor and the
    /// reclamation drainer, and deposits the shared object if one was given.
    pub async fn connect(transport: T, config: Config, exports: Exports) -> Result<Self> {
        let (core, queue) = SessionCore::build(transport, config);

        for reg in &exports.types {
            core.registry.register_type(
                Arc::clone(&reg.info),
                reg.stub_factory.clone(),
                reg.skeleton_factory.clone(),
            );
        }
        for (name, obj) in &exports.named {
            core.export_named(name, obj)
                .context("failed to export named object")?;
        }

        tokio::try_join!(core.handshake_open(), core.handshake_accept())
            .context("session handshake failed")?;

        core.touch_peer_heartbeat();
        core.start_clock().context("failed to start heartbeat clock")?;
        tokio::spawn(run_acceptor(Arc::clone(&core)));

        let admin = core
            .peer_admin_stub()
            .context("handshake finished without a peer admin")?;
        let registry_core = Arc::downgrade(&core);
        tokio::spawn(reclaim::run_reclaimer(
            queue.rx,
            admin,
            core.heartbeat() / 2,
            core.cfg.reclamation.batch as usize,
            move |key| {
                registry_core
                    .upgrade()
                    .map(|core| core.registry.remove_stub_if_dead(key))
                    .unwrap_or(false)
            },
            core.lifecycle.clone(),
        ));

        let session = Self {
            core,
        };
        if let Some(shared) = &exports.shared {
            session.send(Some(shared.clone())).await?;
        }
        Ok(session)
    }

    pub fn local_address(&self) -> &str {
        &self.core.local_addr
    }

    pub fn remote_address(&self) -> &str {
        &self.core.remote_addr
    }

    /// Resolves a name the peer exported. `None` when the peer knows no such
    /// name.
    pub async fn lookup(&self, name: &str) -> Result<Option<Arc<Stub>>, RemoteError> {
        let admin = self.core.peer_admin_stub()?;
        match admin.lookup(name).await? {
            Value::Null => Ok(None),
            Value::Remote(RemoteRef::Stub(stub)) => Ok(Some(stub)),
            other => Err(RemoteError::Marshal(format!(
                "lookup returned an unexpected value: {other:?}"
            ))),
        }
    }

    /// Exposes `obj` under `name` for the peer's `lookup`.
    pub fn export(&self, name: &str, obj: LocalRemote) -> Result<(), RemoteError> {
        if self.core.is_closing() {
            return Err(RemoteError::SessionClosed);
        }
        self.core.export_named(name, &obj)
    }

    /// Deposits the shared server object on the peer (null allowed).
    pub async fn send(&self, obj: Option<LocalRemote>) -> Result<(), RemoteError> {
        let admin = self.core.peer_admin_stub()?;
        let value = match obj {
            Some(lr) => self
                .core
                .prepare_value(Value::Remote(RemoteRef::Local(lr)))?,
            None => Value::Null,
        };
        admin.set_remote_server(value).await
    }

    /// Waits for the peer's shared server object. `None` means the peer
    /// explicitly shared null.
    pub async fn receive(&self) -> Result<Option<Value>, RemoteError> {
        self.core.receive_shared().await
    }

    /// Proactive disposal: tombstones the stub locally and tells the peer to
    /// drop the skeleton.
    pub async fn dispose(&self, stub: &Arc<Stub>) -> Result<(), RemoteError> {
        if !stub.dispose() {
            return Ok(());
        }
        let admin = self.core.peer_admin_stub()?;
        admin.disposed(stub.identifier().key()).await
    }

    /// Writes the batch terminator and settles the batch's completions.
    pub async fn flush(&self, batch: &mut Batch) -> Result<(), RemoteError> {
        let support = self.core.as_support();
        support.flush_batch(batch).await
    }

    /// Orderly shutdown: refuse new invocations, notify the peer, cancel
    /// scheduled tasks, drop skeletons and close the transport.
    pub async fn close(&self) {
        self.core.close_internal(true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closing()
    }

    /// Registers a type after establishment (first-class for tests and late
    /// bindings).
    pub fn register_type(
        &self,
        info: Arc<RemoteInfo>,
        stub_factory: Option<Arc<dyn crate::session::skeleton::StubFactory>>,
        skeleton_factory: Option<Arc<dyn crate::session::skeleton::SkeletonFactory>>,
    ) {
        self.core.registry.register_type(info, stub_factory, skeleton_factory);
    }

    /// Live skeleton count, observable for reclamation tests.
    pub fn skeleton_count(&self) -> usize {
        self.core.registry.skeleton_count()
    }

    /// Idle channels currently pooled.
    pub fn idle_channels(&self) -> usize {
        self.core.pool.idle_len()
    }

    /// Scheduled tasks currently in the delay set.
    pub fn scheduled_tasks(&self) -> usize {
        self.core.scheduler.scheduled_len()
    }
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side proxy runtime.
//!
//! A [`Stub`] forwards calls over a pooled channel to the peer's skeleton.
//! All channel choreography goes through a [`StubSupport`] the session hands
//! out and later atomically swaps for a tombstone on disposal, so a disposed
//! stub fails every operation without holding the session alive.
//!
//! Batched calls pin their channel inside an explicit [`Batch`] guard owned
//! by the caller; the guard replaces the source design's thread-local pin
//! and makes `unbatch`/`rebatch` a move in and out of the guard.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    channel::{Channel, ChannelError},
    codec::{
        Status,
        input::InvocationInput,
        output::InvocationOutput,
        throwable::WireThrowable,
        value::Value,
    },
    error::RemoteError,
    ident::{IdentBytes, VersionedIdentifier},
    remote::{completion::Completion, info::{MethodFlags, MethodInfo, RemoteInfo}},
    scheduler::TaskHandle,
    session::BoxFut,
};

/// Where a pipe's channel returns when the user closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeHome {
    /// Client side: back to the idle pool.
    Pool,
    /// Server side: back under a reader task.
    Reader,
}

/// Session-facing contract behind every stub.
pub trait StubSupport: Send + Sync {
    /// `(local, remote)` transport addresses, for throwable stamping.
    fn session_addresses(&self) -> (String, String);

    fn is_session_closed(&self) -> bool;

    /// Replaces local remote references by their marshalled form, exporting
    /// skeletons as a side effect, and stamps outgoing throwables.
    fn prepare_args(&self, args: Vec<Value>) -> Result<Vec<Value>, RemoteError>;

    /// Resolves marshalled remote references into live stubs or the local
    /// original; may fetch an unknown type descriptor from the peer admin.
    fn resolve_value(&self, value: Value) -> BoxFut<'_, Result<Value, RemoteError>>;

    /// Acquires a channel and writes the request header (the object
    /// identifier). The caller writes the selector and arguments.
    fn invoke(&self, id: VersionedIdentifier) -> BoxFut<'_, Result<Channel, RemoteError>>;

    /// Schedules a task that closes `ch` when `timeout` expires.
    fn schedule_timeout(
        &self,
        ch: &Channel,
        timeout: Duration,
    ) -> Result<TaskHandle, RemoteError>;

    /// Returns the channel to the pool after normal completion.
    fn finished(&self, ch: Channel, reset: bool);

    /// As [`StubSupport::finished`], also cancelling the timeout task.
    /// Returns `false` when the timer had already fired.
    fn finished_and_cancel_timeout(
        &self,
        ch: Channel,
        reset: bool,
        timeout: TaskHandle,
    ) -> bool;

    /// Closes the broken channel and maps `cause` for the caller.
    fn failed(&self, ch: Channel, cause: RemoteError) -> RemoteError;

    /// As [`StubSupport::failed`]; when cancellation reports the timer
    /// fired, the cause is rewritten as a timeout.
    fn failed_and_cancel_timeout(
        &self,
        ch: Channel,
        cause: RemoteError,
        timeout: TaskHandle,
        budget: Duration,
    ) -> RemoteError;

    /// Pins `ch` to the caller's batch.
    fn batched(&self, batch: &mut Batch, ch: Channel);

    /// As [`StubSupport::batched`], also cancelling the timeout task.
    fn batched_and_cancel_timeout(
        &self,
        batch: &mut Batch,
        ch: Channel,
        timeout: TaskHandle,
    ) -> bool;

    /// Temporarily detaches the batch's pinned channel across a non-batched
    /// call.
    fn unbatch(&self, batch: &mut Batch) -> Option<Channel>;

    /// Restores a channel previously detached with [`StubSupport::unbatch`].
    fn rebatch(&self, batch: &mut Batch, ch: Option<Channel>);

    /// Hands the raw channel to the caller as a user-level pipe.
    fn release(&self, ch: Channel) -> Pipe;

    /// Takes a recycled pipe channel back into custody.
    fn recycle_pipe(&self, ch: Channel, home: PipeHome);

    /// Allocates a completion and the marshalled callback argument whose
    /// skeleton feeds it.
    fn create_completion(&self) -> Result<(Completion, Value), RemoteError>;

    /// Mints a tentative identifier for a batched call's remote result and
    /// builds the optimistic stub bound to it.
    fn create_batched_remote(
        &self,
        info: Arc<RemoteInfo>,
    ) -> Result<(Arc<Stub>, VersionedIdentifier), RemoteError>;

    /// Writes the batch terminator, awaits the acknowledgement and settles
    /// the batch's pending completions.
    fn flush_batch<'a>(&'a self, batch: &'a mut Batch) -> BoxFut<'a, Result<(), RemoteError>>;

    /// Tombstone factory used when a stub is disposed.
    fn dispose_support(&self, id: VersionedIdentifier) -> Arc<dyn StubSupport>;
}

/// Pinned channel and pending completions of one logical batch.
#[derive(Default)]
pub struct Batch {
    channel: Option<Channel>,
    pending: Vec<Completion>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn take_channel(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    pub(crate) fn pin(&mut self, ch: Channel) {
        debug_assert!(self.channel.is_none(), "batch already pinned");
        self.channel = Some(ch);
    }

    pub(crate) fn push_pending(&mut self, completion: Completion) {
        self.pending.push(completion);
    }

    pub(crate) fn complete_all(&mut self) {
        for completion in self.pending.drain(..) {
            completion.state().complete(Value::Null);
        }
    }

    pub(crate) fn fail_all(&mut self, throwable: &WireThrowable) {
        for completion in self.pending.drain(..) {
            completion.state().fail(throwable.clone());
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if let Some(ch) = self.channel.take() {
            debug!("batch dropped with pinned channel {}, closing", ch.id());
            ch.kill();
        }
        if !self.pending.is_empty() {
            let lost = RemoteError::TransportClosed("batch dropped".to_string());
            self.fail_all(&lost.to_throwable());
        }
    }
}

/// User-visible duplex byte stream carved out of a channel.
pub struct Pipe {
    ch: Option<Channel>,
    support: Arc<dyn StubSupport>,
    home: PipeHome,
}

impl Pipe {
    pub(crate) fn new(ch: Channel, support: Arc<dyn StubSupport>, home: PipeHome) -> Self {
        Self {
            ch: Some(ch),
            support,
            home,
        }
    }

    fn channel(&mut self) -> Result<&mut Channel, RemoteError> {
        self.ch
            .as_mut()
            .ok_or_else(|| RemoteError::Illegal("pipe already closed".to_string()))
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        self.channel()?.write_all(data).await.map_err(map_channel_err)
    }

    pub async fn flush(&mut self) -> Result<(), RemoteError> {
        self.channel()?.flush().await.map_err(map_channel_err)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), RemoteError> {
        self.channel()?.read_exact(buf).await.map_err(map_channel_err)
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<(), RemoteError> {
        let ch = self.channel()?;
        let mut out = InvocationOutput::new(ch);
        out.write_value(value).await.map_err(map_channel_err)
    }

    pub async fn read_value(&mut self) -> Result<Value, RemoteError> {
        let ch = self.channel()?;
        let mut inp = InvocationInput::new(ch);
        inp.read_value().await.map_err(map_channel_err)
    }

    /// Recycles the underlying channel: emits the suspend marker, drains the
    /// peer's half of the conversation to its marker, resumes framing and
    /// returns the channel to the pool (or the reader, server side).
    pub async fn close(mut self) -> Result<(), RemoteError> {
        let mut ch = self
            .ch
            .take()
            .ok_or_else(|| RemoteError::Illegal("pipe already closed".to_string()))?;
        let outcome = async {
            ch.suspend().await?;
            ch.drain_until_suspended().await?;
            ch.input_resume();
            Ok::<(), ChannelError>(())
        }
        .await;
        match outcome {
            Ok(()) => {
                self.support.recycle_pipe(ch, self.home);
                Ok(())
            },
            Err(e) => {
                ch.kill();
                Err(map_channel_err(e))
            },
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(ch) = self.ch.take() {
            debug!("pipe dropped without close, killing channel {}", ch.id());
            ch.kill();
        }
    }
}

/// Client-side proxy bound to a skeleton on the peer.
pub struct Stub {
    id: VersionedIdentifier,
    type_id: IdentBytes,
    info: Arc<RemoteInfo>,
    support: Mutex<Arc<dyn StubSupport>>,
    disposed: AtomicBool,
    typed: OnceCell<Arc<dyn Any + Send + Sync>>,
    reclaim: Option<mpsc::UnboundedSender<IdentBytes>>,
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("id", &self.id)
            .field("type", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl Stub {
    /// Binds a raw stub by hand. Sessions normally create stubs while
    /// resolving marshalled references; this is the seam they go through.
    pub fn new(
        id: VersionedIdentifier,
        type_id: IdentBytes,
        info: Arc<RemoteInfo>,
        support: Arc<dyn StubSupport>,
        reclaim: Option<mpsc::UnboundedSender<IdentBytes>>,
    ) -> Self {
        Self {
            id,
            type_id,
            info,
            support: Mutex::new(support),
            disposed: AtomicBool::new(false),
            typed: OnceCell::new(),
            reclaim,
        }
    }

    pub fn identifier(&self) -> VersionedIdentifier {
        self.id
    }

    pub fn type_id(&self) -> IdentBytes {
        self.type_id
    }

    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.info
    }

    pub fn support(&self) -> Arc<dyn StubSupport> {
        Arc::clone(&self.support.lock().expect("stub support poisoned"))
    }

    /// The application-facing typed proxy, if a stub factory produced one.
    pub fn typed(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.typed.get()
    }

    pub(crate) fn set_typed(&self, typed: Arc<dyn Any + Send + Sync>) {
        let _ = self.typed.set(typed);
    }

    /// Swaps the support for a tombstone; every later operation fails with
    /// `NoSuchObjectException`. Returns `false` when already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut slot = self.support.lock().expect("stub support poisoned");
        let tombstone = slot.dispose_support(self.id);
        *slot = tombstone;
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn method(&self, selector: u32) -> Result<&MethodInfo, RemoteError> {
        self.info
            .method(selector)
            .ok_or(RemoteError::NoSuchMethod(selector))
    }

    /// Synchronous invocation; waits for the peer's response.
    pub async fn call(&self, selector: u32, args: Vec<Value>) -> Result<Value, RemoteError> {
        self.call_with_timeout(selector, args, None).await
    }

    /// Synchronous invocation with an explicit timeout overriding the
    /// descriptor defaults.
    pub async fn call_with_timeout(
        &self,
        selector: u32,
        args: Vec<Value>,
        explicit: Option<Duration>,
    ) -> Result<Value, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        let budget = resolve_timeout(explicit, method, &self.info);
        let disposer = method.flags.contains(MethodFlags::DISPOSER);
        let args = support.prepare_args(args)?;

        let ch = support.invoke(self.id).await?;
        let outcome = match budget {
            Some(budget_dur) => {
                let mut ch = ch;
                let timeout = match support.schedule_timeout(&ch, budget_dur) {
                    Ok(handle) => handle,
                    Err(e) => {
                        support.finished(ch, true);
                        return Err(e);
                    },
                };
                match transact(&mut ch, selector, args).await {
                    Ok(outcome) => {
                        support.finished_and_cancel_timeout(ch, true, timeout);
                        settle(&support, outcome).await
                    },
                    Err(e) => Err(support.failed_and_cancel_timeout(
                        ch,
                        map_channel_err(e),
                        timeout,
                        budget_dur,
                    )),
                }
            },
            None => {
                let mut ch = ch;
                match transact(&mut ch, selector, args).await {
                    Ok(outcome) => {
                        support.finished(ch, true);
                        settle(&support, outcome).await
                    },
                    Err(e) => Err(support.failed(ch, map_channel_err(e))),
                }
            },
        };
        // A disposer's successful return unexported the peer skeleton; swap
        // in the tombstone so later calls fail synchronously.
        if disposer && outcome.is_ok() {
            self.dispose();
        }
        outcome
    }

    /// Fire-and-forget asynchronous invocation: the request is flushed and
    /// the channel released before the peer runs the body.
    pub async fn call_async(&self, selector: u32, args: Vec<Value>) -> Result<(), RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if !method.is_asynchronous() {
            return Err(RemoteError::Illegal(format!(
                "{} is not asynchronous",
                method.name
            )));
        }
        let args = support.prepare_args(args)?;
        let mut ch = support.invoke(self.id).await?;
        match write_request(&mut ch, selector, args).await {
            Ok(()) => {
                support.finished(ch, true);
                Ok(())
            },
            Err(e) => Err(support.failed(ch, map_channel_err(e))),
        }
    }

    /// Asynchronous invocation returning a completion the peer settles with
    /// its single callback.
    pub async fn call_async_completion(
        &self,
        selector: u32,
        args: Vec<Value>,
    ) -> Result<Completion, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if !method.flags.contains(MethodFlags::COMPLETION) {
            return Err(RemoteError::Illegal(format!(
                "{} does not complete asynchronously",
                method.name
            )));
        }
        let mut args = support.prepare_args(args)?;
        let (completion, callback) = support.create_completion()?;
        args.push(callback);
        let mut ch = support.invoke(self.id).await?;
        match write_request(&mut ch, selector, args).await {
            Ok(()) => {
                support.finished(ch, true);
                Ok(completion)
            },
            Err(e) => Err(support.failed(ch, map_channel_err(e))),
        }
    }

    /// Buffers a batched invocation on the batch's pinned channel; the wire
    /// write happens with the call that closes the batch.
    pub async fn call_batched(
        &self,
        batch: &mut Batch,
        selector: u32,
        args: Vec<Value>,
    ) -> Result<Completion, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if !method.is_batched() {
            return Err(RemoteError::Illegal(format!(
                "{} is not batched",
                method.name
            )));
        }
        let args = support.prepare_args(args)?;
        let mut ch = self.batch_channel(&support, batch).await?;
        match buffer_request(&mut ch, selector, args, None).await {
            Ok(()) => {
                let completion = Completion::new();
                batch.push_pending(completion.clone());
                support.batched(batch, ch);
                Ok(completion)
            },
            Err(e) => {
                let cause = support.failed(ch, map_channel_err(e));
                batch.fail_all(&cause.to_throwable());
                Err(cause)
            },
        }
    }

    /// Batched invocation whose nominal result is a remote: the identifier
    /// is assigned optimistically now and the peer binds its result to it
    /// when the batch executes.
    pub async fn call_batched_remote(
        &self,
        batch: &mut Batch,
        selector: u32,
        args: Vec<Value>,
        returns: Arc<RemoteInfo>,
    ) -> Result<Arc<Stub>, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if !method.is_batched() {
            return Err(RemoteError::Illegal(format!(
                "{} is not batched",
                method.name
            )));
        }
        let args = support.prepare_args(args)?;
        let (stub, tentative) = support.create_batched_remote(returns)?;
        let mut ch = self.batch_channel(&support, batch).await?;
        match buffer_request(&mut ch, selector, args, Some(tentative)).await {
            Ok(()) => {
                let completion = Completion::new();
                batch.push_pending(completion.clone());
                support.batched(batch, ch);
                Ok(stub)
            },
            Err(e) => {
                let cause = support.failed(ch, map_channel_err(e));
                batch.fail_all(&cause.to_throwable());
                Err(cause)
            },
        }
    }

    /// Non-batched call that closes the batch: queued requests execute on
    /// the peer in program order, then this call's own response is read. A
    /// throwable from any queued call surfaces here and skips the rest.
    pub async fn call_in_batch(
        &self,
        batch: &mut Batch,
        selector: u32,
        args: Vec<Value>,
    ) -> Result<Value, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if method.is_batched() {
            return Err(RemoteError::Illegal(format!(
                "{} is batched and cannot close a batch",
                method.name
            )));
        }
        let args = support.prepare_args(args)?;
        let mut ch = support
            .unbatch(batch)
            .ok_or_else(|| RemoteError::Illegal("no open batch".to_string()))?;
        if let Err(e) = write_header(&mut ch, self.id).await {
            let cause = support.failed(ch, map_channel_err(e));
            batch.fail_all(&cause.to_throwable());
            return Err(cause);
        }
        match transact(&mut ch, selector, args).await {
            Ok(Ok(value)) => {
                batch.complete_all();
                support.finished(ch, true);
                settle(&support, Ok(value)).await
            },
            Ok(Err(throwable)) => {
                batch.fail_all(&throwable);
                support.finished(ch, true);
                Err(RemoteError::Peer(Box::new(throwable)))
            },
            Err(e) => {
                let cause = support.failed(ch, map_channel_err(e));
                batch.fail_all(&cause.to_throwable());
                Err(cause)
            },
        }
    }

    /// Hands the raw channel to the caller as a request-reply pipe after
    /// writing the request header and arguments.
    pub async fn request_reply(
        &self,
        selector: u32,
        args: Vec<Value>,
    ) -> Result<Pipe, RemoteError> {
        let support = self.support();
        let method = self.method(selector)?;
        if !method.flags.contains(MethodFlags::PIPE) {
            return Err(RemoteError::Illegal(format!(
                "{} is not a pipe method",
                method.name
            )));
        }
        let args = support.prepare_args(args)?;
        let mut ch = support.invoke(self.id).await?;
        match write_request(&mut ch, selector, args).await {
            Ok(()) => Ok(support.release(ch)),
            Err(e) => Err(support.failed(ch, map_channel_err(e))),
        }
    }

    async fn batch_channel(
        &self,
        support: &Arc<dyn StubSupport>,
        batch: &mut Batch,
    ) -> Result<Channel, RemoteError> {
        match support.unbatch(batch) {
            Some(mut ch) => match write_header(&mut ch, self.id).await {
                Ok(()) => Ok(ch),
                Err(e) => {
                    let cause = support.failed(ch, map_channel_err(e));
                    batch.fail_all(&cause.to_throwable());
                    Err(cause)
                },
            },
            None => support.invoke(self.id).await,
        }
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        if let Some(tx) = &self.reclaim {
            let _ = tx.send(self.id.key());
        }
    }
}

/// Explicit parameter first, then the method default, then the interface
/// default. Negative means infinite; zero still allows a best-effort
/// attempt that expires immediately.
fn resolve_timeout(
    explicit: Option<Duration>,
    method: &MethodInfo,
    info: &RemoteInfo,
) -> Option<Duration> {
    if let Some(d) = explicit {
        return Some(d);
    }
    let millis = method.timeout_millis().or_else(|| info.timeout_millis())?;
    if millis < 0 {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}

pub(crate) fn map_channel_err(e: ChannelError) -> RemoteError {
    match e {
        ChannelError::Codec(c) => RemoteError::Marshal(c.to_string()),
        other => RemoteError::TransportClosed(other.to_string()),
    }
}

async fn write_header(
    ch: &mut Channel,
    id: VersionedIdentifier,
) -> Result<(), ChannelError> {
    let mut out = InvocationOutput::new(ch);
    out.write_identifier(&id).await
}

async fn buffer_request(
    ch: &mut Channel,
    selector: u32,
    args: Vec<Value>,
    tentative: Option<VersionedIdentifier>,
) -> Result<(), ChannelError> {
    let mut out = InvocationOutput::new(ch);
    out.write_varuint(selector).await?;
    out.write_value(&Value::List(args)).await?;
    if let Some(id) = tentative {
        out.write_raw(id.bytes()).await?;
    }
    Ok(())
}

async fn write_request(
    ch: &mut Channel,
    selector: u32,
    args: Vec<Value>,
) -> Result<(), ChannelError> {
    buffer_request(ch, selector, args, None).await?;
    ch.flush().await
}

async fn transact(
    ch: &mut Channel,
    selector: u32,
    args: Vec<Value>,
) -> Result<Result<Value, WireThrowable>, ChannelError> {
    buffer_request(ch, selector, args, None).await?;
    ch.flush().await?;
    let mut inp = InvocationInput::new(ch);
    match inp.read_status().await? {
        Status::Ok => Ok(Ok(inp.read_value().await?)),
        Status::Throwable => Ok(Err(inp.read_throwable().await?)),
        Status::BatchAck => Ok(Ok(Value::Null)),
    }
}

async fn settle(
    support: &Arc<dyn StubSupport>,
    outcome: Result<Value, WireThrowable>,
) -> Result<Value, RemoteError> {
    match outcome {
        Ok(value) => support.resolve_value(value).await,
        Err(throwable) => Err(RemoteError::Peer(Box::new(throwable))),
    }
}

/// Tombstone support installed by [`Stub::dispose`]: every operation fails
/// with `NoSuchObjectException`.
pub(crate) struct DisposedSupport {
    pub id: VersionedIdentifier,
    pub local: String,
    pub remote: String,
}

impl DisposedSupport {
    fn gone(&self) -> RemoteError {
        RemoteError::NoSuchObject(self.id)
    }
}

impl StubSupport for DisposedSupport {
    fn session_addresses(&self) -> (String, String) {
        (self.local.clone(), self.remote.clone())
    }

    fn is_session_closed(&self) -> bool {
        false
    }

    fn prepare_args(&self, _args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        Err(self.gone())
    }

    fn resolve_value(&self, _value: Value) -> BoxFut<'_, Result<Value, RemoteError>> {
        Box::pin(std::future::ready(Err(self.gone())))
    }

    fn invoke(&self, _id: VersionedIdentifier) -> BoxFut<'_, Result<Channel, RemoteError>> {
        Box::pin(std::future::ready(Err(self.gone())))
    }

    fn schedule_timeout(
        &self,
        _ch: &Channel,
        _timeout: Duration,
    ) -> Result<TaskHandle, RemoteError> {
        Err(self.gone())
    }

    fn finished(&self, ch: Channel, _reset: bool) {
        ch.kill();
    }

    fn finished_and_cancel_timeout(
        &self,
        ch: Channel,
        _reset: bool,
        timeout: TaskHandle,
    ) -> bool {
        ch.kill();
        timeout.cancel()
    }

    fn failed(&self, ch: Channel, _cause: RemoteError) -> RemoteError {
        ch.kill();
        self.gone()
    }

    fn failed_and_cancel_timeout(
        &self,
        ch: Channel,
        _cause: RemoteError,
        timeout: TaskHandle,
        _budget: Duration,
    ) -> RemoteError {
        timeout.cancel();
        ch.kill();
        self.gone()
    }

    fn batched(&self, _batch: &mut Batch, ch: Channel) {
        ch.kill();
    }

    fn batched_and_cancel_timeout(
        &self,
        _batch: &mut Batch,
        ch: Channel,
        timeout: TaskHandle,
    ) -> bool {
        ch.kill();
        timeout.cancel()
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
        ch.kill();
        Pipe::new_dead(self.id, &self.local, &self.remote)
    }

    fn recycle_pipe(&self, ch: Channel, _home: PipeHome) {
        ch.kill();
    }

    fn create_completion(&self) -> Result<(Completion, Value), RemoteError> {
        Err(self.gone())
    }

    fn create_batched_remote(
        &self,
        _info: Arc<RemoteInfo>,
    ) -> Result<(Arc<Stub>, VersionedIdentifier), RemoteError> {
        Err(self.gone())
    }

    fn flush_batch<'a>(&'a self, batch: &'a mut Batch) -> BoxFut<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let gone = self.gone();
            batch.fail_all(&gone.to_throwable());
            if let Some(ch) = batch.take_channel() {
                ch.kill();
            }
            Err(gone)
        })
    }

    fn dispose_support(&self, id: VersionedIdentifier) -> Arc<dyn StubSupport> {
        Arc::new(DisposedSupport {
            id,
            local: self.local.clone(),
            remote: self.remote.clone(),
        })
    }
}

impl Pipe {
    /// Placeholder pipe produced by a tombstone support; every operation
    /// fails as the channel is already dead.
    fn new_dead(id: VersionedIdentifier, local: &str, remote: &str) -> Self {
        Pipe {
            ch: None,
            support: Arc::new(DisposedSupport {
                id,
                local: local.to_string(),
                remote: remote.to_string(),
            }),
            home: PipeHome::Pool,
        }
    }
}

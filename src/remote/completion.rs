// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One-shot futures carrying the result of an asynchronous remote call.
//!
//! A completion transitions monotonically to completed: the first value or
//! throwable wins and later writes are ignored. Waiters are signalled on
//! completion and on cancellation. The stub side holds a [`Completion`];
//! the matching skeleton-side callback object feeds it with the peer's
//! single callback invocation.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

use crate::{codec::throwable::WireThrowable, codec::value::Value, error::RemoteError};

#[derive(Debug, Default)]
pub struct CompletionState {
    slot: Mutex<Option<Result<Value, WireThrowable>>>,
    notify: Notify,
    done: AtomicBool,
}

impl CompletionState {
    /// Delivers the value; a no-op if already completed.
    pub fn complete(&self, value: Value) {
        self.deliver(Ok(value));
    }

    /// Delivers a throwable; a no-op if already completed.
    pub fn fail(&self, throwable: WireThrowable) {
        self.deliver(Err(throwable));
    }

    fn deliver(&self, outcome: Result<Value, WireThrowable>) {
        {
            let mut slot = self.slot.lock().expect("completion poisoned");
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// The caller-facing half of an asynchronous call's result.
#[derive(Debug, Clone)]
pub struct Completion {
    state: Arc<CompletionState>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CompletionState::default()),
        }
    }

    pub fn state(&self) -> Arc<CompletionState> {
        Arc::clone(&self.state)
    }

    /// Waits for the peer's callback (or a local cancellation).
    pub async fn wait(&self) -> Result<Value, RemoteError> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before the probe so a completion racing in between
            // still wakes this waiter.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_now() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Non-blocking probe.
    pub fn try_now(&self) -> Option<Result<Value, RemoteError>> {
        if !self.state.is_done() {
            return None;
        }
        let slot = self.state.slot.lock().expect("completion poisoned");
        slot.as_ref().map(|outcome| {
            outcome
                .clone()
                .map_err(|t| RemoteError::Peer(Box::new(t)))
        })
    }

    /// Fails the completion locally (session close, batch abort).
    pub fn cancel(&self, error: &RemoteError) {
        self.state.fail(error.to_throwable());
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cooperative scheduler backing every timeout and background task of a
//! session.
//!
//! Immediate work runs on tokio workers gated by a semaphore with a hard
//! cap, so a saturated pool rejects instead of queueing without bound.
//! Delayed work sits in a `BTreeMap` ordered by `(deadline, sequence)`; a
//! dedicated runner waits on the head deadline and dispatches expired
//! entries. Cancelling a scheduled task removes its map entry immediately —
//! O(log n), never deferred to the next poll — which is what per-call
//! timeout cancellation relies on.
//!
//! The runner never holds the delay-set mutex while executing a task body,
//! and callers never block while holding it.

pub mod task;

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Notify, Semaphore},
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::RemoteError,
    scheduler::task::{NextRun, OneShot, Period, TaskFn, TaskKey, TaskState},
};

struct Entry {
    run: TaskFn,
    period: Period,
    state: Arc<TaskState>,
}

struct Inner {
    delayed: Mutex<BTreeMap<TaskKey, Entry>>,
    notify: Notify,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    terminated: Notify,
    runner_done: AtomicBool,
    seq: AtomicU64,
    epoch: Instant,
    saturation_dump: bool,
    saturation_exit: bool,
}

impl Inner {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn(&self, run: impl Future<Output = ()> + Send + 'static) -> Result<(), RemoteError> {
        if self.shutdown.is_cancelled() {
            return Err(RemoteError::Rejected);
        }
        let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
            self.report_saturation();
            return Err(RemoteError::Rejected);
        };
        tokio::spawn(async move {
            run.await;
            drop(permit);
        });
        Ok(())
    }

    fn report_saturation(&self) {
        if self.saturation_dump {
            error!(
                available = self.workers.available_permits(),
                "worker pool saturated"
            );
        }
        if self.saturation_exit {
            error!("worker pool saturated, exiting per configuration");
            std::process::exit(2);
        }
    }
}

/// Handle to a scheduled task.
pub struct TaskHandle {
    state: Arc<TaskState>,
    inner: Weak<Inner>,
}

impl TaskHandle {
    /// Removes the task from the delay set immediately. Returns `true` when
    /// the task had not yet fired; `false` means the deadline already
    /// dispatched it (for timeout tasks: the timer won).
    pub fn cancel(&self) -> bool {
        self.state.cancelled.store(true, Ordering::SeqCst);
        if let Some(inner) = self.inner.upgrade() {
            let mut delayed = inner.delayed.lock().expect("scheduler poisoned");
            if let Some(key) = self
                .state
                .key
                .lock()
                .expect("task state poisoned")
                .take()
            {
                delayed.remove(&key);
            }
        }
        !self.state.has_fired()
    }

    pub fn has_fired(&self) -> bool {
        self.state.has_fired()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(workers: usize, saturation_dump: bool, saturation_exit: bool) -> Self {
        let inner = Arc::new(Inner {
            delayed: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: CancellationToken::new(),
            terminated: Notify::new(),
            runner_done: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            epoch: Instant::now(),
            saturation_dump,
            saturation_exit,
        });
        let runner = Arc::clone(&inner);
        tokio::spawn(run_loop(runner));
        Self {
            inner,
        }
    }

    /// Submits work for immediate execution. Fails with
    /// [`RemoteError::Rejected`] when the pool is full or shut down.
    pub fn execute<F>(&self, fut: F) -> Result<(), RemoteError>
    where F: Future<Output = ()> + Send + 'static {
        self.inner.spawn(fut)
    }

    /// Inserts a task into the delay set; it runs on or after `now + delay`
    /// and repeats per `period`.
    pub fn schedule(
        &self,
        delay: Duration,
        period: Period,
        run: TaskFn,
    ) -> Result<TaskHandle, RemoteError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RemoteError::Rejected);
        }
        let key = TaskKey {
            at: self
                .inner
                .now_nanos()
                .saturating_add(delay.as_nanos() as u64),
            seq: self.inner.next_seq(),
        };
        let state = Arc::new(TaskState::default());
        *state.key.lock().expect("task state poisoned") = Some(key);
        {
            let mut delayed = self.inner.delayed.lock().expect("scheduler poisoned");
            delayed.insert(
                key,
                Entry {
                    run,
                    period,
                    state: Arc::clone(&state),
                },
            );
        }
        self.inner.notify.notify_one();
        Ok(TaskHandle {
            state,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Convenience wrapper turning an async closure into a [`TaskFn`].
    pub fn schedule_fn<F, Fut>(
        &self,
        delay: Duration,
        period: Period,
        f: F,
    ) -> Result<TaskHandle, RemoteError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(
            delay,
            period,
            Arc::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(f())
            }),
        )
    }

    /// Refuses new tasks, clears the delay set and wakes the runner so it
    /// can terminate.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        {
            let mut delayed = self.inner.delayed.lock().expect("scheduler poisoned");
            for entry in delayed.values() {
                entry.state.cancelled.store(true, Ordering::SeqCst);
                *entry.state.key.lock().expect("task state poisoned") = None;
            }
            delayed.clear();
        }
        self.inner.workers.close();
        self.inner.notify.notify_one();
    }

    pub async fn await_termination(&self) {
        if self.inner.runner_done.load(Ordering::SeqCst) {
            return;
        }
        self.inner.terminated.notified().await;
    }

    /// Number of tasks currently sitting in the delay set.
    pub fn scheduled_len(&self) -> usize {
        self.inner.delayed.lock().expect("scheduler poisoned").len()
    }
}

enum Step {
    Run(TaskFn, Arc<TaskState>),
    Sleep(u64),
    Idle,
}

async fn run_loop(inner: Arc<Inner>) {
    debug!("scheduler runner started");
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let now = inner.now_nanos();
        let step = {
            let mut delayed = inner.delayed.lock().expect("scheduler poisoned");
            match delayed.first_key_value().map(|(k, _)| *k) {
                None => Step::Idle,
                Some(key) if key.at <= now => {
                    let entry = delayed.remove(&key).expect("head entry vanished");
                    entry.state.fired.store(true, Ordering::SeqCst);
                    match entry.period.next_at(key.at, now) {
                        Some(next)
                            if !entry.state.cancelled.load(Ordering::SeqCst) =>
                        {
                            let next_key = TaskKey {
                                at: next,
                                seq: inner.next_seq(),
                            };
                            *entry.state.key.lock().expect("task state poisoned") =
                                Some(next_key);
                            delayed.insert(
                                next_key,
                                Entry {
                                    run: Arc::clone(&entry.run),
                                    period: entry.period,
                                    state: Arc::clone(&entry.state),
                                },
                            );
                        },
                        _ => {
                            *entry.state.key.lock().expect("task state poisoned") =
                                None;
                        },
                    }
                    Step::Run(entry.run, entry.state)
                },
                Some(key) => Step::Sleep(key.at),
            }
        };
        match step {
            Step::Run(run, state) => {
                let fut = run();
                if inner.spawn(fut).is_err() {
                    if inner.shutdown.is_cancelled() {
                        break;
                    }
                    // Saturated: retry the dispatch at "now".
                    warn!("scheduler dispatch rejected, retrying");
                    sleep(Duration::from_millis(1)).await;
                    let key = TaskKey {
                        at: inner.now_nanos(),
                        seq: inner.next_seq(),
                    };
                    {
                        // Periodic tasks already track their next entry.
                        let mut slot =
                            state.key.lock().expect("task state poisoned");
                        if slot.is_none() {
                            *slot = Some(key);
                        }
                    }
                    let mut delayed =
                        inner.delayed.lock().expect("scheduler poisoned");
                    delayed.insert(
                        key,
                        Entry {
                            run,
                            period: Period::OneShot(OneShot),
                            state,
                        },
                    );
                }
            },
            Step::Sleep(at) => {
                let deadline = inner.epoch + Duration::from_nanos(at);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.notify.notified() => {},
                    _ = sleep_until(deadline) => {},
                }
            },
            Step::Idle => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.notify.notified() => {},
                }
            },
        }
    }
    inner.runner_done.store(true, Ordering::SeqCst);
    inner.terminated.notify_waiters();
    debug!("scheduler runner terminated");
}

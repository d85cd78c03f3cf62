// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use enum_dispatch::enum_dispatch;
use rand::RngExt;

/// Work submitted to the scheduler: a factory producing one run's future.
pub type TaskFn =
    std::sync::Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Ordering key of a scheduled task: deadline in nanoseconds since the
/// scheduler epoch, with a sequence number breaking ties FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskKey {
    pub at: u64,
    pub seq: u64,
}

/// Computes the deadline of the next run, if any.
#[enum_dispatch]
pub trait NextRun {
    /// `scheduled_at` is the deadline that just expired, `now` the current
    /// scheduler clock. `None` ends the task.
    fn next_at(&self, scheduled_at: u64, now: u64) -> Option<u64>;
}

/// Runs once and is forgotten.
#[derive(Debug, Clone, Copy)]
pub struct OneShot;

/// Fixed-rate: deadlines advance by the period from the previous deadline,
/// so late runs do not shift the cadence.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate {
    pub period: Duration,
}

/// Fixed-delay: the next deadline counts from the end of the current run's
/// dispatch.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
}

/// Fixed-delay with a uniform random draw in `[low, high]` per run.
#[derive(Debug, Clone, Copy)]
pub struct Jittered {
    pub low: Duration,
    pub high: Duration,
}

impl NextRun for OneShot {
    fn next_at(&self, _scheduled_at: u64, _now: u64) -> Option<u64> {
        None
    }
}

impl NextRun for FixedRate {
    fn next_at(&self, scheduled_at: u64, _now: u64) -> Option<u64> {
        Some(scheduled_at.saturating_add(self.period.as_nanos() as u64))
    }
}

impl NextRun for FixedDelay {
    fn next_at(&self, _scheduled_at: u64, now: u64) -> Option<u64> {
        Some(now.saturating_add(self.delay.as_nanos() as u64))
    }
}

impl NextRun for Jittered {
    fn next_at(&self, _scheduled_at: u64, now: u64) -> Option<u64> {
        let low = self.low.as_nanos() as u64;
        let high = (self.high.as_nanos() as u64).max(low);
        let draw = rand::rng().random_range(low..=high);
        Some(now.saturating_add(draw))
    }
}

#[enum_dispatch(NextRun)]
#[derive(Debug, Clone, Copy)]
pub enum Period {
    OneShot,
    FixedRate,
    FixedDelay,
    Jittered,
}

/// Shared between a scheduled entry and its handle; tracks where the task
/// currently sits in the delay set and whether it ever ran.
#[derive(Debug, Default)]
pub struct TaskState {
    pub(super) key: Mutex<Option<TaskKey>>,
    pub(super) fired: AtomicBool,
    pub(super) cancelled: AtomicBool,
}

impl TaskState {
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

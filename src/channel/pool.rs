// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{channel::Channel, transport::BoxedDuplex};

/// Idle-channel pool between two peers.
///
/// Channels are lent to one caller for the duration of a call and returned
/// for reuse. The idle list is a LIFO stack under a single mutex; nothing
/// blocks while holding it. The pool keeps a kill-switch clone for every
/// channel it ever adopted, lent or idle, so session close can cancel
/// in-flight I/O without owning the channels.
pub struct ChannelPool {
    idle: Mutex<Vec<Channel>>,
    cancels: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
    cap: usize,
    io_timeout: Duration,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(cap: usize, io_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(cap)),
            cancels: DashMap::new(),
            next_id: AtomicU64::new(1),
            cap,
            io_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Wraps a transport stream into a tracked channel.
    pub fn adopt(&self, stream: BoxedDuplex) -> Channel {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.cancels.insert(id, cancel.clone());
        Channel::new(id, stream, cancel, self.io_timeout)
    }

    /// Pops an idle channel, reset and ready to be lent out.
    pub fn pop_idle(&self) -> Option<Channel> {
        let mut ch = {
            let mut idle = self.idle.lock().expect("channel pool poisoned");
            idle.pop()?
        };
        ch.reset();
        Some(ch)
    }

    /// Returns a lent channel. Cancelled or suspended channels are
    /// discarded; beyond the soft cap the channel is closed instead of kept.
    pub fn release(&self, mut ch: Channel, reset: bool) {
        if self.closed.load(Ordering::SeqCst) || ch.is_cancelled() || ch.is_suspended()
        {
            self.discard(ch);
            return;
        }
        if reset {
            ch.reset();
        }
        let overflow = {
            let mut idle = self.idle.lock().expect("channel pool poisoned");
            if idle.len() < self.cap {
                idle.push(ch);
                None
            } else {
                Some(ch)
            }
        };
        if let Some(ch) = overflow {
            debug!("channel pool at cap, closing channel {}", ch.id());
            self.discard(ch);
        }
    }

    /// Kills a channel and forgets its kill switch.
    pub fn discard(&self, ch: Channel) {
        ch.kill();
        self.cancels.remove(&ch.id());
    }

    /// Drops tracking for a channel that left the pool's custody for good
    /// (handed to the user as a pipe).
    pub fn forget(&self, id: u64) {
        self.cancels.remove(&id);
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().expect("channel pool poisoned").len()
    }

    /// Cancels every channel ever adopted and still tracked.
    pub fn kill_all(&self) {
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
        self.cancels.clear();
        self.idle.lock().expect("channel pool poisoned").clear();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.kill_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Distributed reclamation.
//!
//! Dropping the last reference to a stub pushes its identifier onto an
//! unbounded queue (the drop-observation analog of a reference queue). A
//! single drainer task buffers collected identifiers and notifies the peer
//! with `disposed_batch` when the buffer reaches the batch size or the
//! heartbeat interval elapses, whichever comes first. No user task ever
//! blocks on the drainer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ident::IdentBytes, session::admin::AdminStub};

/// Identifiers shipped per `disposed_batch` notification.
pub const DISPOSAL_BATCH: usize = 100;

pub struct ReclaimQueue {
    pub tx: mpsc::UnboundedSender<IdentBytes>,
    pub rx: mpsc::UnboundedReceiver<IdentBytes>,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
        }
    }
}

impl Default for ReclaimQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains dropped-stub notifications until the session shuts down.
///
/// `confirm_dead` lets the registry veto identifiers that were re-registered
/// between the drop and the drain.
pub async fn run_reclaimer(
    mut rx: mpsc::UnboundedReceiver<IdentBytes>,
    admin: AdminStub,
    interval: Duration,
    batch_size: usize,
    confirm_dead: impl Fn(&IdentBytes) -> bool,
    shutdown: CancellationToken,
) {
    let mut buf: Vec<IdentBytes> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            dropped = rx.recv() => {
                match dropped {
                    Some(id) => {
                        if confirm_dead(&id) {
                            buf.push(id);
                        }
                        if buf.len() >= batch_size {
                            flush(&admin, &mut buf).await;
                        }
                    },
                    None => break,
                }
            },
            _ = tick.tick() => {
                if !buf.is_empty() {
                    flush(&admin, &mut buf).await;
                }
            },
        }
    }
    debug!("reclaimer terminated with {} undelivered identifiers", buf.len());
}

async fn flush(admin: &AdminStub, buf: &mut Vec<IdentBytes>) {
    let ids = std::mem::take(buf);
    debug!("notifying peer of {} disposed stubs", ids.len());
    if let Err(e) = admin.disposed_batch(&ids).await {
        warn!("disposal notification failed: {e}");
    }
}

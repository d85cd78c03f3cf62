// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use rmi_session_rs::{
    error::RemoteError,
    scheduler::{
        Scheduler,
        task::{FixedDelay, FixedRate, OneShot, Period},
    },
};
use serial_test::serial;
use tokio::{sync::mpsc, time::Instant};

fn scheduler() -> Scheduler {
    Scheduler::new(4, false, false)
}

#[tokio::test]
async fn test_execute_runs_immediately() -> Result<()> {
    let sched = scheduler();
    let (tx, mut rx) = mpsc::unbounded_channel();
    sched.execute(async move {
        let _ = tx.send(7u32);
    })?;
    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(got, Some(7));
    Ok(())
}

#[tokio::test]
async fn test_execute_rejected_when_saturated() -> Result<()> {
    let sched = Scheduler::new(1, false, false);
    let gate = Arc::new(tokio::sync::Notify::new());
    let held = Arc::clone(&gate);
    sched.execute(async move {
        held.notified().await;
    })?;
    // The single worker slot is occupied; the next submit must bounce.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let refused = sched.execute(async {});
    assert!(matches!(refused, Err(RemoteError::Rejected)));
    gate.notify_waiters();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_schedule_fires_on_or_after_deadline() -> Result<()> {
    let sched = scheduler();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let start = Instant::now();
    sched.schedule_fn(
        Duration::from_millis(50),
        Period::OneShot(OneShot),
        move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        },
    )?;
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await?
        .expect("task fired");
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(sched.scheduled_len(), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_cancel_is_immediate_and_final() -> Result<()> {
    let sched = scheduler();
    let fired = Arc::new(AtomicU32::new(0));
    let observer = Arc::clone(&fired);
    let handle = sched.schedule_fn(
        Duration::from_millis(60),
        Period::OneShot(OneShot),
        move || {
            let observer = Arc::clone(&observer);
            async move {
                observer.fetch_add(1, Ordering::SeqCst);
            }
        },
    )?;
    assert_eq!(sched.scheduled_len(), 1);

    assert!(handle.cancel(), "cancelled before the deadline");
    // Cancellation removes the entry immediately, not at the next poll.
    assert_eq!(sched.scheduled_len(), 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0, "cancelled task never fires");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_cancel_after_fire_reports_fired() -> Result<()> {
    let sched = scheduler();
    let handle = sched.schedule_fn(
        Duration::from_millis(10),
        Period::OneShot(OneShot),
        || async {},
    )?;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!handle.cancel(), "timer already fired");
    assert!(handle.has_fired());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_same_deadline_runs_fifo() -> Result<()> {
    let sched = scheduler();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for tag in 0u32..4 {
        let tx = tx.clone();
        sched.schedule_fn(
            Duration::from_millis(40),
            Period::OneShot(OneShot),
            move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(tag);
                }
            },
        )?;
    }
    drop(tx);
    let mut order = Vec::new();
    while let Some(tag) =
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?
    {
        order.push(tag);
        if order.len() == 4 {
            break;
        }
    }
    assert_eq!(order, vec![0, 1, 2, 3], "ties break in submission order");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_fixed_rate_repeats_until_cancelled() -> Result<()> {
    let sched = scheduler();
    let count = Arc::new(AtomicU32::new(0));
    let observer = Arc::clone(&count);
    let handle = sched.schedule_fn(
        Duration::from_millis(20),
        Period::FixedRate(FixedRate {
            period: Duration::from_millis(20),
        }),
        move || {
            let observer = Arc::clone(&observer);
            async move {
                observer.fetch_add(1, Ordering::SeqCst);
            }
        },
    )?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let seen = count.load(Ordering::SeqCst);
    assert!(seen >= 3, "expected several periodic runs, saw {seen}");

    handle.cancel();
    assert_eq!(sched.scheduled_len(), 0);
    // Let a dispatch already in flight land before freezing the count.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frozen = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(count.load(Ordering::SeqCst), frozen, "no runs after cancel");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_fixed_delay_spacing() -> Result<()> {
    let sched = scheduler();
    let (tx, mut rx) = mpsc::unbounded_channel();
    sched.schedule_fn(
        Duration::from_millis(10),
        Period::FixedDelay(FixedDelay {
            delay: Duration::from_millis(30),
        }),
        move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Instant::now());
            }
        },
    )?;
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await?
        .expect("first run");
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await?
        .expect("second run");
    assert!(second - first >= Duration::from_millis(25));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_clears_and_refuses() -> Result<()> {
    let sched = scheduler();
    sched.schedule_fn(Duration::from_secs(60), Period::OneShot(OneShot), || async {})?;
    assert_eq!(sched.scheduled_len(), 1);

    sched.shutdown();
    assert_eq!(sched.scheduled_len(), 0, "delay set cleared on shutdown");
    assert!(matches!(sched.execute(async {}), Err(RemoteError::Rejected)));
    assert!(
        sched
            .schedule_fn(Duration::from_millis(1), Period::OneShot(OneShot), || async {})
            .is_err()
    );
    sched.await_termination().await;
    Ok(())
}

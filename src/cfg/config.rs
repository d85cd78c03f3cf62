// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Heartbeat and I/O deadlines of the session clock.
    #[serde(default)]
    pub session: SessionSettings,
    /// Channel pool limits.
    #[serde(default)]
    pub channels: ChannelSettings,
    /// Worker pool bounds for dispatch and timers.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Distributed reclamation knobs.
    #[serde(default)]
    pub reclamation: ReclamationSettings,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionSettings {
    #[serde(rename = "HeartbeatMillis", with = "serde_millis")]
    /// Peer liveness window H: we send every H/2 and expect one within H.
    pub heartbeat: Duration,

    #[serde(rename = "IoTimeoutMillis", with = "serde_millis")]
    /// Per-operation channel I/O budget (writes and mid-frame reads).
    pub io_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelSettings {
    #[serde(rename = "PoolCap")]
    /// Soft cap on idle channels retained per session.
    pub pool_cap: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            pool_cap: 16,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SchedulerSettings {
    #[serde(rename = "Workers")]
    /// Maximum concurrently running worker tasks.
    pub workers: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 16,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReclamationSettings {
    #[serde(rename = "DisposalBatch")]
    /// Identifiers buffered before a disposal notification is forced out.
    pub batch: u32,
}

impl Default for ReclamationSettings {
    fn default() -> Self {
        Self {
            batch: 100,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.session.heartbeat >= Duration::from_millis(10),
            "HeartbeatMillis must be at least 10"
        );
        ensure!(
            self.session.io_timeout >= Duration::from_millis(10),
            "IoTimeoutMillis must be at least 10"
        );
        ensure!(self.channels.pool_cap >= 1, "PoolCap must be >= 1");
        ensure!(self.scheduler.workers >= 1, "Workers must be >= 1");
        ensure!(self.reclamation.batch >= 1, "DisposalBatch must be >= 1");
        Ok(())
    }
}

/// Process-wide flags consulted once at startup and snapshotted into each
/// session at construction, never re-read per call.
#[derive(Debug, Clone)]
pub struct ProcessFlags {
    /// Prune server stack traces before transport. Default true.
    pub prune_stack_traces: bool,
    /// Log a diagnostic when the worker pool saturates. Default false.
    pub saturation_dump: bool,
    /// Hard-exit the process when the worker pool saturates. Default false.
    pub saturation_exit: bool,
}

static PROCESS_FLAGS: Lazy<ProcessFlags> = Lazy::new(|| ProcessFlags {
    prune_stack_traces: env_flag("RMI_PRUNE_STACK_TRACES", true),
    saturation_dump: env_flag("RMI_SATURATION_DUMP", false),
    saturation_exit: env_flag("RMI_SATURATION_EXIT", false),
});

pub fn process_flags() -> &'static ProcessFlags {
    &PROCESS_FLAGS
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

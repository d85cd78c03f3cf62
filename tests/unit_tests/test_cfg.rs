// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rmi_session_rs::cfg::{cli::resolve_config_path, config::Config};

#[test]
fn test_config_loads_from_yaml() -> Result<()> {
    let cfg = resolve_config_path("tests/config.yaml").and_then(Config::load_from_file)?;
    assert_eq!(cfg.session.heartbeat, Duration::from_secs(30));
    assert_eq!(cfg.session.io_timeout, Duration::from_secs(5));
    assert_eq!(cfg.channels.pool_cap, 8);
    assert_eq!(cfg.scheduler.workers, 8);
    assert_eq!(cfg.reclamation.batch, 100);
    Ok(())
}

#[test]
fn test_config_defaults_apply() -> Result<()> {
    let mut cfg: Config = serde_yaml::from_str("{}")?;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.session.heartbeat, Duration::from_secs(30));
    assert_eq!(cfg.channels.pool_cap, 16);
    Ok(())
}

#[test]
fn test_config_rejects_zero_workers() {
    let mut cfg = Config::default();
    cfg.scheduler.workers = 0;
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn test_config_rejects_tiny_heartbeat() {
    let mut cfg = Config::default();
    cfg.session.heartbeat = Duration::from_millis(1);
    assert!(cfg.validate_and_normalize().is_err());
}

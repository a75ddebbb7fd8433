// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for steward-worker.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the control channel binds to
    pub control_addr: SocketAddr,
    /// IP the HTTP and HTTPS listeners bind on
    pub listen_ip: IpAddr,
    /// Root of the per-worker state directories
    pub state_dir: PathBuf,
    /// Worker-local identifier keying the persisted record
    pub worker_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            state_dir: PathBuf::from(".data"),
            worker_id: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `STEWARD_CONTROL_ADDR`: control channel address (default: `127.0.0.1:7400`)
    /// - `STEWARD_LISTEN_IP`: listener IP (default: `0.0.0.0`)
    /// - `STEWARD_STATE_DIR`: state directory root (default: `.data`)
    /// - `STEWARD_WORKER_ID`: worker identifier (default: `default`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let control_addr = match lookup("STEWARD_CONTROL_ADDR") {
            Some(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("STEWARD_CONTROL_ADDR", "a socket address such as 127.0.0.1:7400")
            })?,
            None => default.control_addr,
        };

        let listen_ip = match lookup("STEWARD_LISTEN_IP") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid("STEWARD_LISTEN_IP", "an IPv4 or IPv6 address"))?,
            None => default.listen_ip,
        };

        let state_dir = lookup("STEWARD_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(default.state_dir);

        let worker_id = lookup("STEWARD_WORKER_ID").unwrap_or(default.worker_id);
        if worker_id.is_empty() {
            return Err(ConfigError::Invalid("STEWARD_WORKER_ID", "a non-empty identifier"));
        }

        Ok(Self {
            control_addr,
            listen_ip,
            state_dir,
            worker_id,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value of the wrong shape.
    #[error("Invalid value for {0}: expected {1}")]
    Invalid(&'static str, &'static str),
}

//! Service configuration, loaded from `VMNET_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use vmnet_networking::{AddressAllocator, NetworkError, DEFAULT_RANGE_END, DEFAULT_RANGE_START};

use crate::network::{IpCommandConfig, Readiness};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Use the in-memory link backend instead of `ip`/`iptables`.
    pub dev_mode: bool,
    pub subnet_range_start: String,
    pub subnet_range_end: String,
    pub ip_bin: String,
    pub iptables_bin: String,
    pub ip_forward_path: PathBuf,
    pub tap_ready_timeout: Duration,
    pub tap_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let listen_addr: SocketAddr = var("VMNET_LISTEN_ADDR", "0.0.0.0:8080")
            .parse()
            .context("invalid VMNET_LISTEN_ADDR")?;

        let log_level = var("VMNET_LOG_LEVEL", "info");

        let dev_mode = lookup("VMNET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let millis = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(v) => v
                    .parse()
                    .map(Duration::from_millis)
                    .with_context(|| format!("invalid {key}: {v}")),
                None => Ok(Duration::from_millis(default)),
            }
        };

        let config = Self {
            listen_addr,
            log_level,
            dev_mode,
            subnet_range_start: var("VMNET_SUBNET_RANGE_START", DEFAULT_RANGE_START),
            subnet_range_end: var("VMNET_SUBNET_RANGE_END", DEFAULT_RANGE_END),
            ip_bin: var("VMNET_IP_BIN", "ip"),
            iptables_bin: var("VMNET_IPTABLES_BIN", "iptables"),
            ip_forward_path: var("VMNET_IP_FORWARD_PATH", "/proc/sys/net/ipv4/ip_forward").into(),
            tap_ready_timeout: millis("VMNET_TAP_READY_TIMEOUT_MS", 5000)?,
            tap_poll_interval: millis("VMNET_TAP_POLL_INTERVAL_MS", 50)?,
        };

        // Reject a bad range now rather than on the first request.
        config.allocator()?;

        Ok(config)
    }

    /// Allocator over the configured subnet range.
    pub fn allocator(&self) -> Result<AddressAllocator, NetworkError> {
        AddressAllocator::from_range(&self.subnet_range_start, &self.subnet_range_end)
    }

    pub fn ip_command_config(&self) -> IpCommandConfig {
        IpCommandConfig {
            ip_bin: self.ip_bin.clone(),
            iptables_bin: self.iptables_bin.clone(),
            ip_forward_path: self.ip_forward_path.clone(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            timeout: self.tap_ready_timeout,
            poll_interval: self.tap_poll_interval,
        }
    }
}

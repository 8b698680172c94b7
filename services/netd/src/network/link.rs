//! Kernel link management backend.
//!
//! The `LinkBackend` trait abstracts every host-side effect of provisioning:
//! - creating and deleting bridge and tap devices
//! - assigning addresses, setting links up, setting bridge membership
//! - NAT masquerade rules in the `nat` table's `POSTROUTING` chain
//! - the system-wide IPv4 forwarding flag
//!
//! `IpCommandBackend` drives `ip(8)` and `iptables(8)`; a mock implementation
//! lives in `network::mock`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::LinkError;

/// Kind of a network link, as far as provisioning cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Tap,
    /// A link without driver info, typically a physical NIC.
    Device,
    Other(String),
}

/// Observed state of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub kind: LinkKind,
    /// Administratively up.
    pub up: bool,
    /// Bridge the link is a member of.
    pub master: Option<String>,
}

/// Host network operations used by the provisioners.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Look up a link by name; `None` if it does not exist.
    async fn link_state(&self, name: &str) -> Result<Option<LinkState>, LinkError>;

    /// Create a bridge device.
    async fn create_bridge(&self, name: &str) -> Result<(), LinkError>;

    /// Create a tap device.
    async fn create_tap(&self, name: &str) -> Result<(), LinkError>;

    /// Delete a link of any kind.
    async fn delete_link(&self, name: &str) -> Result<(), LinkError>;

    /// Assign an IPv4 address with prefix length to a link.
    async fn add_address(
        &self,
        name: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), LinkError>;

    /// Bring a link administratively up.
    async fn set_link_up(&self, name: &str) -> Result<(), LinkError>;

    /// Make `name` a member of `bridge`.
    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError>;

    /// Append a masquerade rule for traffic leaving via `out_interface`
    /// unless an identical rule exists.
    ///
    /// Returns `true` if a rule was inserted.
    async fn ensure_masquerade(&self, out_interface: &str) -> Result<bool, LinkError>;

    /// Delete the masquerade rule for `out_interface`.
    async fn remove_masquerade(&self, out_interface: &str) -> Result<(), LinkError>;

    /// Enable IPv4 forwarding. Idempotent.
    async fn enable_ipv4_forwarding(&self) -> Result<(), LinkError>;
}

/// Locations of the host tools and files `IpCommandBackend` uses.
#[derive(Debug, Clone)]
pub struct IpCommandConfig {
    /// `ip` binary.
    pub ip_bin: String,
    /// `iptables` binary.
    pub iptables_bin: String,
    /// IPv4 forwarding flag file.
    pub ip_forward_path: PathBuf,
}

impl Default for IpCommandConfig {
    fn default() -> Self {
        Self {
            ip_bin: "ip".to_string(),
            iptables_bin: "iptables".to_string(),
            ip_forward_path: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
        }
    }
}

/// Backend that shells out to iproute2 and iptables.
#[derive(Debug, Clone, Default)]
pub struct IpCommandBackend {
    config: IpCommandConfig,
    /// Serializes masquerade check-then-append so concurrent requests for
    /// one uplink cannot both append.
    masquerade: Arc<Mutex<()>>,
}

/// Outcome of a command that ran to completion.
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl IpCommandBackend {
    pub fn new(config: IpCommandConfig) -> Self {
        Self {
            config,
            masquerade: Arc::default(),
        }
    }

    /// Run a command, returning its output whatever the exit status.
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput, LinkError> {
        debug!(program, args = %args.join(" "), "Running command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| LinkError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command and fail on a non-zero exit.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, LinkError> {
        let output = self.exec(program, args).await?;
        if !output.success {
            return Err(LinkError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    async fn run_ip(&self, args: &[&str]) -> Result<String, LinkError> {
        self.run(&self.config.ip_bin, args).await
    }

    fn masquerade_args<'a>(action: &'a str, out_interface: &'a str) -> [&'a str; 9] {
        [
            "-w",
            "-t",
            "nat",
            action,
            "POSTROUTING",
            "-o",
            out_interface,
            "-j",
            "MASQUERADE",
        ]
    }
}

#[async_trait]
impl LinkBackend for IpCommandBackend {
    async fn link_state(&self, name: &str) -> Result<Option<LinkState>, LinkError> {
        let args = ["-j", "-d", "link", "show", "dev", name];
        let output = self.exec(&self.config.ip_bin, &args).await?;
        let command = format!("{} {}", self.config.ip_bin, args.join(" "));

        if !output.success {
            if output.stderr.contains("does not exist") {
                return Ok(None);
            }
            return Err(LinkError::CommandFailed {
                command,
                stderr: output.stderr,
            });
        }

        parse_link_show(&output.stdout).map_err(|reason| LinkError::Parse { command, reason })
    }

    async fn create_bridge(&self, name: &str) -> Result<(), LinkError> {
        self.run_ip(&["link", "add", "name", name, "type", "bridge"])
            .await
            .map(drop)
    }

    async fn create_tap(&self, name: &str) -> Result<(), LinkError> {
        self.run_ip(&["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .map(drop)
    }

    async fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        self.run_ip(&["link", "delete", "dev", name]).await.map(drop)
    }

    async fn add_address(
        &self,
        name: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), LinkError> {
        let cidr = format!("{}/{}", address, prefix_len);
        self.run_ip(&["addr", "add", &cidr, "dev", name])
            .await
            .map(drop)
    }

    async fn set_link_up(&self, name: &str) -> Result<(), LinkError> {
        self.run_ip(&["link", "set", "dev", name, "up"])
            .await
            .map(drop)
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError> {
        self.run_ip(&["link", "set", "dev", name, "master", bridge])
            .await
            .map(drop)
    }

    async fn ensure_masquerade(&self, out_interface: &str) -> Result<bool, LinkError> {
        let _guard = self.masquerade.lock().await;
        let iptables = &self.config.iptables_bin;
        let check = Self::masquerade_args("-C", out_interface);
        let output = self.exec(iptables, &check).await?;

        match output.code {
            Some(0) => return Ok(false),
            // Exit status 1 from -C means the rule is absent.
            Some(1) => {}
            _ => {
                return Err(LinkError::CommandFailed {
                    command: format!("{} {}", iptables, check.join(" ")),
                    stderr: output.stderr,
                })
            }
        }

        self.run(iptables, &Self::masquerade_args("-A", out_interface))
            .await?;
        Ok(true)
    }

    async fn remove_masquerade(&self, out_interface: &str) -> Result<(), LinkError> {
        let _guard = self.masquerade.lock().await;
        self.run(
            &self.config.iptables_bin,
            &Self::masquerade_args("-D", out_interface),
        )
        .await
        .map(drop)
    }

    async fn enable_ipv4_forwarding(&self) -> Result<(), LinkError> {
        let path = &self.config.ip_forward_path;
        tokio::fs::write(path, "1")
            .await
            .map_err(|source| LinkError::Write {
                path: path.clone(),
                source,
            })
    }
}

/// Subset of `ip -j -d link show` output.
#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

/// Parse the JSON printed by `ip -j -d link show dev <name>`.
fn parse_link_show(stdout: &str) -> Result<Option<LinkState>, String> {
    let links: Vec<IpLink> = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let Some(link) = links.into_iter().next() else {
        return Ok(None);
    };

    let kind = match link.linkinfo {
        None => LinkKind::Device,
        Some(info) => match info.info_kind.as_deref() {
            None => LinkKind::Device,
            Some("bridge") => LinkKind::Bridge,
            Some("tun") => {
                let mode = info
                    .info_data
                    .as_ref()
                    .and_then(|data| data.get("type"))
                    .and_then(|t| t.as_str());
                if mode == Some("tap") {
                    LinkKind::Tap
                } else {
                    LinkKind::Other("tun".to_string())
                }
            }
            Some(other) => LinkKind::Other(other.to_string()),
        },
    };

    Ok(Some(LinkState {
        kind,
        up: link.flags.iter().any(|f| f == "UP"),
        master: link.master,
    }))
}

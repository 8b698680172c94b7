//! Bridge provisioning.
//!
//! Creates a bridge on a freshly allocated /24, NATs it out through the
//! host's uplink and enables forwarding:
//!
//! 1. create the bridge device
//! 2. assign the gateway (`.1/24`)
//! 3. bring the bridge up
//! 4. masquerade traffic leaving via the bridge
//! 5. enable IPv4 forwarding
//! 6. resolve the uplink and masquerade traffic leaving via it
//!
//! Any failure unwinds the completed steps and releases the reservation.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};
use vmnet_id::UserId;
use vmnet_networking::{validate_interface_name, AllocationRecord, Ipv4Prefix};

use super::error::ProvisionError;
use super::ledger::SharedLedger;
use super::link::LinkBackend;
use super::rollback::{RollbackStack, UndoAction};

/// Request to create a bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeRequest {
    /// Name of the bridge device to create.
    pub bridge_name: String,

    /// Existing host interface that carries NATed traffic out.
    pub host_interface: String,
}

/// A provisioned bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDescriptor {
    pub bridge_name: String,
    pub user_id: UserId,
    pub subnet: Ipv4Prefix,
    pub gateway: Ipv4Addr,
}

impl BridgeDescriptor {
    /// The subnet in CIDR notation, e.g. `10.4.9.0/24`.
    pub fn subnet_cidr(&self) -> String {
        self.subnet.to_string()
    }
}

/// Creates bridges with NAT and forwarding.
#[derive(Clone)]
pub struct BridgeProvisioner {
    backend: Arc<dyn LinkBackend>,
    ledger: Arc<SharedLedger>,
}

impl BridgeProvisioner {
    pub fn new(backend: Arc<dyn LinkBackend>, ledger: Arc<SharedLedger>) -> Self {
        Self { backend, ledger }
    }

    /// Provision a bridge for `request`.
    pub async fn provision(
        &self,
        request: &BridgeRequest,
    ) -> Result<BridgeDescriptor, ProvisionError> {
        self.reclaim_stale(&request.bridge_name).await;
        let record = self.ledger.reserve(&request.bridge_name)?;

        info!(
            bridge = %request.bridge_name,
            user_id = %record.user_id,
            subnet = %record.allocation.subnet,
            gateway = %record.allocation.gateway,
            uplink = %request.host_interface,
            "Setting up bridge"
        );

        let mut undo = RollbackStack::new();
        match self.build(request, &record, &mut undo).await {
            Ok(()) => {
                undo.commit();
                self.ledger.confirm(&request.bridge_name);
                info!(bridge = %request.bridge_name, "Bridge ready");
                Ok(BridgeDescriptor {
                    bridge_name: record.bridge_name,
                    user_id: record.user_id,
                    subnet: record.allocation.subnet,
                    gateway: record.allocation.gateway,
                })
            }
            Err(cause) => {
                let err = undo.unwind(self.backend.as_ref(), cause).await;
                self.ledger.release(&request.bridge_name);
                error!(
                    bridge = %request.bridge_name,
                    kind = err.kind(),
                    error = %err,
                    "Error creating bridge"
                );
                Err(err)
            }
        }
    }

    /// Forget a ledger record whose bridge no longer exists on the host.
    ///
    /// Bridges are removed out of band, so the ledger alone cannot tell
    /// whether a name is still in use.
    async fn reclaim_stale(&self, bridge: &str) {
        let Some(record) = self.ledger.get(bridge) else {
            return;
        };

        match self.backend.link_state(bridge).await {
            Ok(None) => {
                if self.ledger.release_stale(&record) {
                    info!(
                        bridge,
                        subnet = %record.allocation.subnet,
                        "Bridge no longer exists, reclaiming its subnet"
                    );
                }
            }
            Ok(Some(_)) => {}
            Err(e) => warn!(bridge, error = %e, "Failed to look up allocated bridge"),
        }
    }

    async fn build(
        &self,
        request: &BridgeRequest,
        record: &AllocationRecord,
        undo: &mut RollbackStack,
    ) -> Result<(), ProvisionError> {
        let bridge = request.bridge_name.as_str();
        let allocation = &record.allocation;

        self.backend
            .create_bridge(bridge)
            .await
            .map_err(|source| ProvisionError::DeviceCreate {
                kind: "bridge",
                name: bridge.to_string(),
                source,
            })?;
        undo.push(UndoAction::DeleteLink(bridge.to_string()));

        self.backend
            .add_address(bridge, allocation.gateway, allocation.subnet.prefix_len)
            .await
            .map_err(|source| ProvisionError::AddressAssign {
                bridge: bridge.to_string(),
                address: allocation.gateway_cidr(),
                source,
            })?;
        info!(bridge, address = %allocation.gateway_cidr(), "Bridge created and assigned IP address");

        self.backend
            .set_link_up(bridge)
            .await
            .map_err(|source| ProvisionError::Activation {
                name: bridge.to_string(),
                source,
            })?;

        self.masquerade(bridge, undo).await?;

        self.backend
            .enable_ipv4_forwarding()
            .await
            .map_err(|source| ProvisionError::ForwardingEnable { source })?;

        let uplink = request.host_interface.as_str();
        self.resolve_uplink(uplink).await?;
        self.masquerade(uplink, undo).await?;

        Ok(())
    }

    /// Install a masquerade rule, recording an undo only if it is new.
    async fn masquerade(
        &self,
        interface: &str,
        undo: &mut RollbackStack,
    ) -> Result<(), ProvisionError> {
        let inserted = self
            .backend
            .ensure_masquerade(interface)
            .await
            .map_err(|source| ProvisionError::NatRule {
                interface: interface.to_string(),
                source,
            })?;
        if inserted {
            undo.push(UndoAction::RemoveMasquerade(interface.to_string()));
        }
        Ok(())
    }

    async fn resolve_uplink(&self, name: &str) -> Result<(), ProvisionError> {
        let not_found = |reason: String| ProvisionError::UplinkNotFound {
            name: name.to_string(),
            reason,
        };

        validate_interface_name(name).map_err(|e| not_found(e.to_string()))?;
        match self.backend.link_state(name).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(not_found("link not found".to_string())),
            Err(e) => Err(not_found(e.to_string())),
        }
    }
}

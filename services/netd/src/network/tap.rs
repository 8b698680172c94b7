//! Tap pair provisioning.
//!
//! Creates `tap-<bridge>-1` and `tap-<bridge>-2` and makes both members of an
//! existing bridge. Per tap:
//!
//! 1. delete any existing device of the same name
//! 2. create the tap device
//! 3. bring it up
//! 4. resolve the bridge
//! 5. attach the tap to the bridge
//!
//! The second tap is only created once the first reports up, bounded by
//! `Readiness::timeout`. One rollback stack covers both taps, so a failure
//! on the second removes the first as well.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vmnet_networking::TapNames;

use super::error::ProvisionError;
use super::link::{LinkBackend, LinkKind};
use super::rollback::{RollbackStack, UndoAction};

/// Request to create a tap pair.
#[derive(Debug, Clone, Deserialize)]
pub struct TapRequest {
    /// Existing bridge the taps join.
    pub bridge_name: String,
}

/// A provisioned tap pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDescriptor {
    pub bridge_name: String,
    pub tap_name_1: String,
    pub tap_name_2: String,
}

/// How long to wait for the first tap before creating the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Creates tap pairs attached to a bridge.
#[derive(Clone)]
pub struct TapProvisioner {
    backend: Arc<dyn LinkBackend>,
    readiness: Readiness,
}

impl TapProvisioner {
    pub fn new(backend: Arc<dyn LinkBackend>, readiness: Readiness) -> Self {
        Self { backend, readiness }
    }

    /// Provision both taps for `request.bridge_name`.
    pub async fn provision(&self, request: &TapRequest) -> Result<TapDescriptor, ProvisionError> {
        let bridge = request.bridge_name.as_str();
        let names = TapNames::for_bridge(bridge)?;
        info!(bridge, tap1 = %names.first, tap2 = %names.second, "Setting up tap pair");

        let mut undo = RollbackStack::new();
        match self.attach_pair(bridge, &names, &mut undo).await {
            Ok(()) => {
                undo.commit();
                Ok(TapDescriptor {
                    bridge_name: bridge.to_string(),
                    tap_name_1: names.first,
                    tap_name_2: names.second,
                })
            }
            Err(cause) => {
                let err = undo.unwind(self.backend.as_ref(), cause).await;
                error!(bridge, kind = err.kind(), error = %err, "Error creating tap pair");
                Err(err)
            }
        }
    }

    async fn attach_pair(
        &self,
        bridge: &str,
        names: &TapNames,
        undo: &mut RollbackStack,
    ) -> Result<(), ProvisionError> {
        self.attach_tap(&names.first, bridge, undo).await?;
        self.wait_until_ready(&names.first).await?;
        self.attach_tap(&names.second, bridge, undo).await?;
        Ok(())
    }

    async fn attach_tap(
        &self,
        tap: &str,
        bridge: &str,
        undo: &mut RollbackStack,
    ) -> Result<(), ProvisionError> {
        self.replace_existing(tap).await?;

        self.backend
            .create_tap(tap)
            .await
            .map_err(|source| ProvisionError::DeviceCreate {
                kind: "tap",
                name: tap.to_string(),
                source,
            })?;
        undo.push(UndoAction::DeleteLink(tap.to_string()));

        self.backend
            .set_link_up(tap)
            .await
            .map_err(|source| ProvisionError::Activation {
                name: tap.to_string(),
                source,
            })?;

        self.resolve_bridge(bridge).await?;

        self.backend
            .set_master(tap, bridge)
            .await
            .map_err(|source| ProvisionError::Attach {
                tap: tap.to_string(),
                bridge: bridge.to_string(),
                source,
            })?;

        info!(tap, bridge, "Tap assigned to bridge");
        Ok(())
    }

    /// Delete a leftover device with the tap's name, if any.
    async fn replace_existing(&self, tap: &str) -> Result<(), ProvisionError> {
        match self.backend.link_state(tap).await {
            Ok(Some(_)) => {
                info!(tap, "Replacing existing device");
                self.backend
                    .delete_link(tap)
                    .await
                    .map_err(|source| ProvisionError::DeviceDelete {
                        name: tap.to_string(),
                        source,
                    })
            }
            Ok(None) => Ok(()),
            Err(e) => {
                // Treat as absent; creation reports a real collision.
                warn!(tap, error = %e, "Failed to look up existing tap");
                Ok(())
            }
        }
    }

    async fn resolve_bridge(&self, bridge: &str) -> Result<(), ProvisionError> {
        let not_found = |reason: String| ProvisionError::BridgeNotFound {
            name: bridge.to_string(),
            reason,
        };

        match self.backend.link_state(bridge).await {
            Ok(Some(state)) if state.kind == LinkKind::Bridge => Ok(()),
            Ok(Some(state)) => Err(not_found(format!("link is {:?}, not a bridge", state.kind))),
            Ok(None) => Err(not_found("link not found".to_string())),
            Err(e) => Err(not_found(e.to_string())),
        }
    }

    /// Poll until `name` exists and is administratively up.
    async fn wait_until_ready(&self, name: &str) -> Result<(), ProvisionError> {
        let Readiness {
            timeout,
            poll_interval,
        } = self.readiness;
        let deadline = Instant::now() + timeout;

        loop {
            match self.backend.link_state(name).await {
                Ok(Some(state)) if state.up => {
                    debug!(tap = name, "Tap ready");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!(tap = name, error = %e, "Readiness check failed"),
            }

            if Instant::now() >= deadline {
                return Err(ProvisionError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

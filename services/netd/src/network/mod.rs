//! Host network provisioning for microVM instances.
//!
//! Each VM pair gets a dedicated bridge with its own /24 and two tap devices
//! attached to it.
//!
//! Architecture:
//! - Bridge per segment with the gateway (`.1`) assigned on the host side
//! - Masquerade rules for the bridge and the uplink, IPv4 forwarding enabled
//! - Tap pair per bridge (`tap-<bridge>-1`, `tap-<bridge>-2`)
//! - Every step that creates host state is undone if a later step fails

mod bridge;
mod error;
mod ledger;
mod link;
pub mod mock;
mod rollback;
mod tap;

pub use bridge::{BridgeDescriptor, BridgeProvisioner, BridgeRequest};
pub use error::{LinkError, ProvisionError};
pub use ledger::SharedLedger;
pub use link::{IpCommandBackend, IpCommandConfig, LinkBackend, LinkKind, LinkState};
pub use rollback::{RollbackStack, UndoAction};
pub use tap::{Readiness, TapDescriptor, TapProvisioner, TapRequest};

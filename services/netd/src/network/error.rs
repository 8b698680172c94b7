//! Provisioning error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vmnet_networking::NetworkError;

/// Failure of a single backend operation.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to parse output of {command}: {reason}")]
    Parse { command: String, reason: String },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Errors from bridge and tap provisioning.
///
/// Every variant renders as a single human-readable line; that line is what
/// callers see in the response `error` field.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("failed to create {kind} {name}: {source}")]
    DeviceCreate {
        kind: &'static str,
        name: String,
        source: LinkError,
    },

    #[error("failed to delete existing device {name}: {source}")]
    DeviceDelete { name: String, source: LinkError },

    #[error("failed to assign IP address {address} to bridge {bridge}: {source}")]
    AddressAssign {
        bridge: String,
        address: String,
        source: LinkError,
    },

    #[error("failed to bring up {name}: {source}")]
    Activation { name: String, source: LinkError },

    #[error("failed to get host interface {name}: {reason}")]
    UplinkNotFound { name: String, reason: String },

    #[error("failed to get bridge link {name}: {reason}")]
    BridgeNotFound { name: String, reason: String },

    #[error("failed to assign {tap} to bridge {bridge}: {source}")]
    Attach {
        tap: String,
        bridge: String,
        source: LinkError,
    },

    #[error("failed to set up NAT rule for {interface}: {source}")]
    NatRule { interface: String, source: LinkError },

    #[error("failed to enable IP forwarding: {source}")]
    ForwardingEnable { source: LinkError },

    #[error("{name} was not ready after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("{cause}; rollback failed: {}", .failures.join("; "))]
    RollbackFailed {
        cause: Box<ProvisionError>,
        failures: Vec<String>,
    },
}

impl ProvisionError {
    /// Stable name of the error kind, used in logs.
    ///
    /// A failed rollback reports the kind of the error that triggered it.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(NetworkError::InvalidRange(_)) => "InvalidRange",
            Self::Network(NetworkError::InvalidPrefix(_)) => "InvalidRange",
            Self::Network(NetworkError::PoolExhausted(_)) => "PoolExhausted",
            Self::Network(NetworkError::InvalidInterfaceName { .. }) => "InvalidInterfaceName",
            Self::Network(NetworkError::BridgeAlreadyAllocated(_)) => "BridgeAlreadyAllocated",
            Self::DeviceCreate { .. } => "DeviceCreateError",
            Self::DeviceDelete { .. } => "DeviceDeleteError",
            Self::AddressAssign { .. } => "AddressAssignError",
            Self::Activation { .. } => "ActivationError",
            Self::UplinkNotFound { .. } => "UplinkNotFound",
            Self::BridgeNotFound { .. } => "BridgeNotFound",
            Self::Attach { .. } => "AttachError",
            Self::NatRule { .. } => "NATRuleError",
            Self::ForwardingEnable { .. } => "ForwardingEnableError",
            Self::Timeout { .. } => "TimeoutError",
            Self::RollbackFailed { cause, .. } => cause.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failure_is_part_of_message() {
        let err = ProvisionError::RollbackFailed {
            cause: Box::new(ProvisionError::Activation {
                name: "br0".to_string(),
                source: LinkError::Rejected("Operation not permitted".to_string()),
            }),
            failures: vec![
                "delete link br0: busy".to_string(),
                "remove masquerade br0: gone".to_string(),
            ],
        };

        assert_eq!(
            err.to_string(),
            "failed to bring up br0: Operation not permitted; rollback failed: \
             delete link br0: busy; remove masquerade br0: gone"
        );
        assert_eq!(err.kind(), "ActivationError");
    }

    #[test]
    fn test_network_errors_pass_through() {
        let err: ProvisionError = NetworkError::InvalidRange("10.0.0".to_string()).into();
        assert_eq!(err.to_string(), "invalid IP address range: 10.0.0");
        assert_eq!(err.kind(), "InvalidRange");
    }
}

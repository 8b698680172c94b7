//! Undo stack for multi-step provisioning.
//!
//! Each step that creates a host resource pushes the action that removes it.
//! On failure the stack is unwound newest-first; on success it is committed
//! and the resources stay.

use tracing::{debug, warn};

use super::error::ProvisionError;
use super::link::LinkBackend;

/// Action that reverses one completed provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Delete a bridge or tap device.
    DeleteLink(String),
    /// Delete a masquerade rule that this operation inserted.
    RemoveMasquerade(String),
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteLink(name) => write!(f, "delete link {}", name),
            Self::RemoveMasquerade(iface) => write!(f, "remove masquerade rule for {}", iface),
        }
    }
}

/// Ordered list of undo actions for one operation.
#[derive(Debug, Default)]
#[must_use = "a rollback stack must be committed or unwound"]
pub struct RollbackStack {
    actions: Vec<UndoAction>,
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the undo for a step that just completed.
    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Pending undo actions, oldest first.
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Keep everything that was created.
    pub fn commit(self) {
        debug!(steps = self.actions.len(), "Committing provisioning steps");
    }

    /// Undo every recorded step in reverse order, then return the error
    /// that caused the rollback.
    ///
    /// Undo failures do not stop the unwind; they are attached to the
    /// returned error.
    pub async fn unwind(self, backend: &dyn LinkBackend, cause: ProvisionError) -> ProvisionError {
        let mut failures = Vec::new();

        for action in self.actions.into_iter().rev() {
            let result = match &action {
                UndoAction::DeleteLink(name) => backend.delete_link(name).await,
                UndoAction::RemoveMasquerade(iface) => backend.remove_masquerade(iface).await,
            };

            match result {
                Ok(()) => debug!(action = %action, "Rolled back"),
                Err(e) => {
                    warn!(action = %action, error = %e, "Rollback step failed");
                    failures.push(format!("{}: {}", action, e));
                }
            }
        }

        if failures.is_empty() {
            cause
        } else {
            ProvisionError::RollbackFailed {
                cause: Box::new(cause),
                failures,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::{MockBackend, MockOp};
    use crate::network::LinkError;

    fn cause() -> ProvisionError {
        ProvisionError::Activation {
            name: "br0".to_string(),
            source: LinkError::Rejected("boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_unwind_reverses_all_steps() {
        let mock = MockBackend::new();
        mock.create_bridge("br0").await.unwrap();
        mock.create_tap("tap0").await.unwrap();
        mock.ensure_masquerade("br0").await.unwrap();

        let mut stack = RollbackStack::new();
        stack.push(UndoAction::DeleteLink("br0".to_string()));
        stack.push(UndoAction::RemoveMasquerade("br0".to_string()));
        stack.push(UndoAction::DeleteLink("tap0".to_string()));

        let err = stack.unwind(&mock, cause()).await;
        assert!(matches!(err, ProvisionError::Activation { .. }));
        assert!(mock.link_names().is_empty());
        assert!(!mock.has_masquerade("br0"));
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let mock = MockBackend::new();
        mock.create_bridge("br0").await.unwrap();
        mock.create_tap("tap0").await.unwrap();
        mock.fail(MockOp::DeleteLink, "tap0");

        let mut stack = RollbackStack::new();
        stack.push(UndoAction::DeleteLink("br0".to_string()));
        stack.push(UndoAction::DeleteLink("tap0".to_string()));

        let err = stack.unwind(&mock, cause()).await;
        assert_eq!(mock.link_names(), vec!["tap0".to_string()]);
        match &err {
            ProvisionError::RollbackFailed { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("delete link tap0"));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
        assert!(err.to_string().contains("rollback failed"));
    }

    #[tokio::test]
    async fn test_commit_keeps_resources() {
        let mock = MockBackend::new();
        mock.create_bridge("br0").await.unwrap();

        let mut stack = RollbackStack::new();
        stack.push(UndoAction::DeleteLink("br0".to_string()));
        assert_eq!(stack.actions().len(), 1);
        stack.commit();

        assert!(mock.link("br0").is_some());
    }
}

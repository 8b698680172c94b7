//! Application state shared across request handlers.

use std::sync::Arc;

use crate::network::{BridgeProvisioner, LinkBackend, Readiness, SharedLedger, TapProvisioner};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    ledger: Arc<SharedLedger>,
    bridges: BridgeProvisioner,
    taps: TapProvisioner,
}

impl AppState {
    /// Create application state over `backend`.
    pub fn new(backend: Arc<dyn LinkBackend>, ledger: SharedLedger, readiness: Readiness) -> Self {
        let ledger = Arc::new(ledger);
        Self {
            inner: Arc::new(AppStateInner {
                bridges: BridgeProvisioner::new(backend.clone(), ledger.clone()),
                taps: TapProvisioner::new(backend, readiness),
                ledger,
            }),
        }
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn bridges(&self) -> &BridgeProvisioner {
        &self.inner.bridges
    }

    pub fn taps(&self) -> &TapProvisioner {
        &self.inner.taps
    }
}

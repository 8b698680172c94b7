//! In-memory link backend for testing and development.
//!
//! Models just enough kernel behaviour for the provisioners: name collisions,
//! bridge membership, administrative state, masquerade rules, and the
//! forwarding flag. Individual operations can be made to fail per target.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::error::LinkError;
use super::link::{LinkBackend, LinkKind, LinkState};

/// Target that matches every name in [`MockBackend::fail`].
pub const ANY_TARGET: &str = "*";

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    LinkState,
    CreateBridge,
    CreateTap,
    DeleteLink,
    AddAddress,
    SetUp,
    SetMaster,
    EnsureMasquerade,
    RemoveMasquerade,
    EnableForwarding,
}

/// A link held by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub kind: LinkKind,
    pub up: bool,
    pub master: Option<String>,
    pub addresses: Vec<(Ipv4Addr, u8)>,
}

impl MockLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            up: false,
            master: None,
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    links: BTreeMap<String, MockLink>,
    masquerade: BTreeSet<String>,
    forwarding: bool,
    failures: HashSet<(MockOp, String)>,
    stalled: HashSet<String>,
}

/// Mock link backend.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Create an empty mock with no links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock holding a single physical uplink that is up.
    pub fn with_uplink(name: &str) -> Self {
        let mock = Self::new();
        mock.add_link(name, LinkKind::Device, true);
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pre-existing link.
    pub fn add_link(&self, name: &str, kind: LinkKind, up: bool) {
        let mut link = MockLink::new(kind);
        link.up = up;
        self.lock().links.insert(name.to_string(), link);
    }

    /// Make `op` fail when applied to `target` ([`ANY_TARGET`] for all).
    pub fn fail(&self, op: MockOp, target: &str) {
        self.lock().failures.insert((op, target.to_string()));
    }

    /// Stop failing `op` for `target`.
    pub fn clear_failure(&self, op: MockOp, target: &str) {
        self.lock().failures.remove(&(op, target.to_string()));
    }

    /// Make `set_link_up` succeed for `name` without the link ever coming up.
    pub fn stall(&self, name: &str) {
        self.lock().stalled.insert(name.to_string());
    }

    /// Snapshot of one link.
    pub fn link(&self, name: &str) -> Option<MockLink> {
        self.lock().links.get(name).cloned()
    }

    /// Names of all links, sorted.
    pub fn link_names(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    /// Whether a masquerade rule exists for `out_interface`.
    pub fn has_masquerade(&self, out_interface: &str) -> bool {
        self.lock().masquerade.contains(out_interface)
    }

    /// Whether IPv4 forwarding has been enabled.
    pub fn forwarding_enabled(&self) -> bool {
        self.lock().forwarding
    }

    fn check(state: &MockState, op: MockOp, target: &str) -> Result<(), LinkError> {
        if state.failures.contains(&(op, target.to_string()))
            || state.failures.contains(&(op, ANY_TARGET.to_string()))
        {
            return Err(LinkError::Rejected(format!(
                "injected {:?} failure for {}",
                op, target
            )));
        }
        Ok(())
    }

    fn create(&self, op: MockOp, name: &str, kind: LinkKind) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, op, name)?;
        if state.links.contains_key(name) {
            return Err(LinkError::Rejected(format!("{}: file exists", name)));
        }
        debug!(link = %name, kind = ?kind, "[MOCK] Creating link");
        state.links.insert(name.to_string(), MockLink::new(kind));
        Ok(())
    }
}

fn no_such_device(name: &str) -> LinkError {
    LinkError::Rejected(format!("{}: no such device", name))
}

#[async_trait]
impl LinkBackend for MockBackend {
    async fn link_state(&self, name: &str) -> Result<Option<LinkState>, LinkError> {
        let state = self.lock();
        Self::check(&state, MockOp::LinkState, name)?;
        Ok(state.links.get(name).map(|link| LinkState {
            kind: link.kind.clone(),
            up: link.up,
            master: link.master.clone(),
        }))
    }

    async fn create_bridge(&self, name: &str) -> Result<(), LinkError> {
        self.create(MockOp::CreateBridge, name, LinkKind::Bridge)
    }

    async fn create_tap(&self, name: &str) -> Result<(), LinkError> {
        self.create(MockOp::CreateTap, name, LinkKind::Tap)
    }

    async fn delete_link(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::DeleteLink, name)?;
        state.links.remove(name).ok_or_else(|| no_such_device(name))?;

        // Deleting a bridge releases its members.
        for link in state.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        debug!(link = %name, "[MOCK] Deleted link");
        Ok(())
    }

    async fn add_address(
        &self,
        name: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::AddAddress, name)?;
        let link = state.links.get_mut(name).ok_or_else(|| no_such_device(name))?;
        if link.addresses.contains(&(address, prefix_len)) {
            return Err(LinkError::Rejected(format!(
                "{}/{} already assigned to {}",
                address, prefix_len, name
            )));
        }
        link.addresses.push((address, prefix_len));
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::SetUp, name)?;
        let stalled = state.stalled.contains(name);
        let link = state.links.get_mut(name).ok_or_else(|| no_such_device(name))?;
        if !stalled {
            link.up = true;
        }
        Ok(())
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::SetMaster, name)?;
        match state.links.get(bridge) {
            Some(link) if link.kind == LinkKind::Bridge => {}
            Some(_) => {
                return Err(LinkError::Rejected(format!("{} is not a bridge", bridge)));
            }
            None => return Err(no_such_device(bridge)),
        }
        let link = state.links.get_mut(name).ok_or_else(|| no_such_device(name))?;
        link.master = Some(bridge.to_string());
        Ok(())
    }

    async fn ensure_masquerade(&self, out_interface: &str) -> Result<bool, LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::EnsureMasquerade, out_interface)?;
        Ok(state.masquerade.insert(out_interface.to_string()))
    }

    async fn remove_masquerade(&self, out_interface: &str) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::RemoveMasquerade, out_interface)?;
        if !state.masquerade.remove(out_interface) {
            return Err(LinkError::Rejected(format!(
                "no masquerade rule for {}",
                out_interface
            )));
        }
        Ok(())
    }

    async fn enable_ipv4_forwarding(&self) -> Result<(), LinkError> {
        let mut state = self.lock();
        Self::check(&state, MockOp::EnableForwarding, ANY_TARGET)?;
        state.forwarding = true;
        Ok(())
    }
}

//! Process-wide allocation state.
//!
//! The random source, the address allocator and the allocation ledger sit
//! behind one lock so that "pick a free subnet" and "record it" happen as a
//! single step. The lock is never held across an await.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use rand::rngs::StdRng;
use tracing::debug;
use vmnet_id::UserId;
use vmnet_networking::{
    validate_interface_name, AddressAllocator, AllocationLedger, AllocationRecord, NetworkError,
};

struct LedgerState {
    rng: StdRng,
    allocator: AddressAllocator,
    ledger: AllocationLedger,
    /// Reserved names whose bridge is still being built.
    pending: HashSet<String>,
}

/// Shared allocator and ledger.
pub struct SharedLedger {
    state: Mutex<LedgerState>,
}

impl SharedLedger {
    /// Create a ledger that draws from `allocator` using `rng`.
    ///
    /// `rng` should be seeded once per process (e.g. `StdRng::from_os_rng()`).
    pub fn new(allocator: AddressAllocator, rng: StdRng) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                rng,
                allocator,
                ledger: AllocationLedger::new(),
                pending: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a user ID and a free /24 for `bridge_name`.
    pub fn reserve(&self, bridge_name: &str) -> Result<AllocationRecord, NetworkError> {
        validate_interface_name(bridge_name)?;

        let mut guard = self.lock();
        let LedgerState {
            rng,
            allocator,
            ledger,
            pending,
        } = &mut *guard;

        if ledger.contains_bridge(bridge_name) {
            return Err(NetworkError::BridgeAlreadyAllocated(bridge_name.to_string()));
        }

        let user_id = UserId::generate(rng);
        let allocation = allocator.allocate_free(rng, ledger)?;
        let record = AllocationRecord {
            bridge_name: bridge_name.to_string(),
            user_id,
            allocation,
            allocated_at: SystemTime::now(),
        };
        ledger.insert(record.clone())?;
        pending.insert(bridge_name.to_string());

        debug!(
            bridge = %bridge_name,
            subnet = %allocation.subnet,
            held = ledger.len(),
            "Reserved subnet"
        );
        Ok(record)
    }

    /// Mark the reservation for `bridge_name` as backed by a built bridge.
    pub fn confirm(&self, bridge_name: &str) {
        self.lock().pending.remove(bridge_name);
    }

    /// Drop the reservation for `bridge_name`.
    pub fn release(&self, bridge_name: &str) -> Option<AllocationRecord> {
        let released = {
            let mut guard = self.lock();
            guard.pending.remove(bridge_name);
            guard.ledger.release(bridge_name)
        };
        if let Some(record) = &released {
            debug!(bridge = %bridge_name, subnet = %record.allocation.subnet, "Released subnet");
        }
        released
    }

    /// The record held for `bridge_name`, if any.
    pub fn get(&self, bridge_name: &str) -> Option<AllocationRecord> {
        self.lock().ledger.get(bridge_name).cloned()
    }

    /// Drop `stale` if it is still the confirmed record for its bridge.
    ///
    /// A record replaced since `stale` was read, or one whose bridge is still
    /// being built, is left alone.
    pub fn release_stale(&self, stale: &AllocationRecord) -> bool {
        let mut guard = self.lock();
        if guard.pending.contains(&stale.bridge_name)
            || guard.ledger.get(&stale.bridge_name) != Some(stale)
        {
            return false;
        }
        guard.ledger.release(&stale.bridge_name);
        debug!(
            bridge = %stale.bridge_name,
            subnet = %stale.allocation.subnet,
            "Released stale subnet"
        );
        true
    }

    /// Current records, ordered by bridge name.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.lock().ledger.records().cloned().collect()
    }
}

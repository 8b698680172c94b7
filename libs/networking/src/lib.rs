//! Networking utilities for bridge provisioning.
//!
//! This library provides helpers for:
//! - IPv4 prefixes and /24 subnet allocation from a configured range
//! - An in-memory ledger of allocated subnets and bridge names
//! - Kernel interface name validation and tap naming

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::SystemTime;

use rand::Rng;
use thiserror::Error;
use vmnet_id::UserId;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The allocation range is malformed or holds no /24 block.
    #[error("invalid IP address range: {0}")]
    InvalidRange(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Every /24 block in the range is already allocated.
    #[error("address pool exhausted: {0}")]
    PoolExhausted(String),

    /// The name cannot be used as a kernel interface name.
    #[error("invalid interface name {name:?}: {reason}")]
    InvalidInterfaceName { name: String, reason: &'static str },

    /// The bridge name is already recorded in the ledger.
    #[error("bridge {0:?} is already allocated")]
    BridgeAlreadyAllocated(String),
}

// ============================================================================
// IPv4 prefixes
// ============================================================================

/// Prefix length of every allocated subnet.
pub const SUBNET_PREFIX_LEN: u8 = 24;

/// Last octet of the gateway address inside an allocated subnet.
pub const GATEWAY_OCTET: u8 = 1;

/// Last octet of the auxiliary host-side address inside an allocated subnet.
pub const HOST_OCTET: u8 = 7;

/// IPv4 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Prefix {
    /// Base address of the prefix.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/8").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidPrefix(format!("invalid address: {}", addr_str)))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Calculate the number of addresses in this prefix.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// Address at `offset` from the base of the prefix.
    fn nth(&self, offset: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | u32::from(offset))
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

// ============================================================================
// Subnet allocation
// ============================================================================

/// Default start of the allocation range.
pub const DEFAULT_RANGE_START: &str = "10.0.0.0";

/// Default end of the allocation range (inclusive).
pub const DEFAULT_RANGE_END: &str = "10.255.255.255";

/// Random draws attempted before falling back to a linear scan.
const RANDOM_ATTEMPTS: usize = 64;

/// A /24 subnet handed out to one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubnetAllocation {
    /// The allocated block, always /24 with last octet 0.
    pub subnet: Ipv4Prefix,

    /// Bridge-facing gateway, the `.1` of the block.
    pub gateway: Ipv4Addr,

    /// Auxiliary host-side address, the `.7` of the block.
    pub host_address: Ipv4Addr,
}

impl SubnetAllocation {
    /// Build the allocation for the /24 block starting at `base`.
    pub fn for_block(base: Ipv4Addr) -> Self {
        let subnet = Ipv4Prefix {
            address: mask_ipv4(base, SUBNET_PREFIX_LEN),
            prefix_len: SUBNET_PREFIX_LEN,
        };
        Self {
            subnet,
            gateway: subnet.nth(GATEWAY_OCTET),
            host_address: subnet.nth(HOST_OCTET),
        }
    }

    /// Gateway address with the subnet mask, as assigned to the bridge.
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.subnet.prefix_len)
    }
}

/// Picks random /24 blocks from an inclusive IPv4 range.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    /// First block-aligned address inside the range.
    first_block: u32,

    /// Number of whole /24 blocks in the range.
    blocks: u32,
}

impl AddressAllocator {
    /// Create an allocator for the inclusive range `start`..=`end`.
    ///
    /// The usable blocks are those lying entirely inside the range; a range
    /// that contains no whole /24 is rejected.
    pub fn from_range(start: &str, end: &str) -> Result<Self, NetworkError> {
        let parse = |s: &str| {
            Ipv4Addr::from_str(s.trim())
                .map_err(|_| NetworkError::InvalidRange(format!("{} is not an IPv4 address", s)))
        };
        let start = u64::from(u32::from(parse(start)?));
        let end = u64::from(u32::from(parse(end)?));

        if start > end {
            return Err(NetworkError::InvalidRange(format!(
                "start {} is after end {}",
                Ipv4Addr::from(start as u32),
                Ipv4Addr::from(end as u32)
            )));
        }

        let first_block = start.div_ceil(256) * 256;
        let blocks = (end + 1).saturating_sub(first_block) / 256;
        if blocks == 0 {
            return Err(NetworkError::InvalidRange(format!(
                "{}-{} contains no complete /24 block",
                Ipv4Addr::from(start as u32),
                Ipv4Addr::from(end as u32)
            )));
        }

        Ok(Self {
            first_block: first_block as u32,
            blocks: blocks as u32,
        })
    }

    /// Allocator for the default 10.0.0.0/8 range.
    pub fn default_range() -> Self {
        Self {
            first_block: u32::from(Ipv4Addr::new(10, 0, 0, 0)),
            blocks: 1 << 16,
        }
    }

    /// Number of /24 blocks the allocator can hand out.
    pub fn capacity(&self) -> u32 {
        self.blocks
    }

    /// Pick a uniformly random block, ignoring any ledger.
    pub fn allocate<R: Rng + ?Sized>(&self, rng: &mut R) -> SubnetAllocation {
        self.block(rng.random_range(0..self.blocks))
    }

    /// Pick a random block that the ledger does not already hold.
    pub fn allocate_free<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        ledger: &AllocationLedger,
    ) -> Result<SubnetAllocation, NetworkError> {
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = self.allocate(rng);
            if !ledger.contains_subnet(&candidate.subnet) {
                return Ok(candidate);
            }
        }

        // Dense ledger: walk every block once from a random offset.
        let offset = rng.random_range(0..self.blocks);
        (0..self.blocks)
            .map(|i| self.block((offset + i) % self.blocks))
            .find(|candidate| !ledger.contains_subnet(&candidate.subnet))
            .ok_or_else(|| {
                NetworkError::PoolExhausted(format!(
                    "all {} /24 blocks from {} are allocated",
                    self.blocks,
                    Ipv4Addr::from(self.first_block)
                ))
            })
    }

    fn block(&self, index: u32) -> SubnetAllocation {
        SubnetAllocation::for_block(Ipv4Addr::from(self.first_block + index * 256))
    }
}

// ============================================================================
// Allocation ledger
// ============================================================================

/// One bridge recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Bridge the subnet is assigned to.
    pub bridge_name: String,

    /// Opaque identifier handed to the caller.
    pub user_id: UserId,

    /// The subnet and its derived addresses.
    pub allocation: SubnetAllocation,

    /// When the allocation was recorded.
    pub allocated_at: SystemTime,
}

/// In-memory index of allocated subnets, keyed by bridge name and subnet.
///
/// The ledger is not synchronized; callers hold it under a single lock for
/// the whole check-then-insert sequence.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    by_bridge: BTreeMap<String, AllocationRecord>,
    by_subnet: HashMap<Ipv4Prefix, String>,
}

impl AllocationLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the subnet is held by some bridge.
    pub fn contains_subnet(&self, subnet: &Ipv4Prefix) -> bool {
        self.by_subnet.contains_key(subnet)
    }

    /// Whether the bridge name is held.
    pub fn contains_bridge(&self, bridge_name: &str) -> bool {
        self.by_bridge.contains_key(bridge_name)
    }

    /// Record an allocation.
    ///
    /// Fails if either the bridge name or the subnet is already present.
    pub fn insert(&mut self, record: AllocationRecord) -> Result<(), NetworkError> {
        if self.contains_bridge(&record.bridge_name) {
            return Err(NetworkError::BridgeAlreadyAllocated(record.bridge_name));
        }
        if let Some(holder) = self.by_subnet.get(&record.allocation.subnet) {
            return Err(NetworkError::PoolExhausted(format!(
                "{} is already held by bridge {:?}",
                record.allocation.subnet, holder
            )));
        }

        self.by_subnet
            .insert(record.allocation.subnet, record.bridge_name.clone());
        self.by_bridge.insert(record.bridge_name.clone(), record);
        Ok(())
    }

    /// Remove a bridge's allocation, returning it if present.
    pub fn release(&mut self, bridge_name: &str) -> Option<AllocationRecord> {
        let record = self.by_bridge.remove(bridge_name)?;
        self.by_subnet.remove(&record.allocation.subnet);
        Some(record)
    }

    /// Look up a bridge's allocation.
    pub fn get(&self, bridge_name: &str) -> Option<&AllocationRecord> {
        self.by_bridge.get(bridge_name)
    }

    /// All records, ordered by bridge name.
    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.by_bridge.values()
    }

    /// Number of allocations held.
    pub fn len(&self) -> usize {
        self.by_bridge.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.by_bridge.is_empty()
    }
}

// ============================================================================
// Interface names
// ============================================================================

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Validate a kernel network interface name.
pub fn validate_interface_name(name: &str) -> Result<(), NetworkError> {
    let invalid = |reason| {
        Err(NetworkError::InvalidInterfaceName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return invalid("name is longer than 15 bytes");
    }
    if name == "." || name == ".." {
        return invalid("name is reserved");
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return invalid("name contains '/', ':', whitespace or control characters");
    }
    Ok(())
}

/// The two tap interface names derived from a bridge name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapNames {
    pub first: String,
    pub second: String,
}

impl TapNames {
    /// Derive `tap-<bridge>-1` and `tap-<bridge>-2`.
    ///
    /// Both names must themselves be valid interface names, which limits the
    /// bridge name to 9 bytes.
    pub fn for_bridge(bridge_name: &str) -> Result<Self, NetworkError> {
        validate_interface_name(bridge_name)?;

        let names = Self {
            first: format!("tap-{}-1", bridge_name),
            second: format!("tap-{}-2", bridge_name),
        };
        validate_interface_name(&names.first)?;
        validate_interface_name(&names.second)?;
        Ok(names)
    }

    /// Both names in creation order.
    pub fn as_array(&self) -> [&str; 2] {
        [&self.first, &self.second]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    fn record(bridge: &str, base: Ipv4Addr) -> AllocationRecord {
        AllocationRecord {
            bridge_name: bridge.to_string(),
            user_id: UserId::parse("abcde").unwrap(),
            allocation: SubnetAllocation::for_block(base),
            allocated_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_ipv4_prefix() {
        let prefix = Ipv4Prefix::from_cidr("10.0.0.0/8").unwrap();
        assert_eq!(prefix.prefix_len, 8);
        assert_eq!(prefix.size(), 1 << 24);

        assert!(prefix.contains("10.200.3.4".parse().unwrap()));
        assert!(!prefix.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_masks_host_bits() {
        let prefix = Ipv4Prefix::from_cidr("10.1.2.3/24").unwrap();
        assert_eq!(prefix.to_string(), "10.1.2.0/24");
        assert!(Ipv4Prefix::from_cidr("10.1.2.3/33").is_err());
        assert!(Ipv4Prefix::from_cidr("10.1.2.3").is_err());
    }

    #[test]
    fn test_allocation_addresses() {
        let alloc = SubnetAllocation::for_block(Ipv4Addr::new(10, 4, 9, 0));
        assert_eq!(alloc.subnet.to_string(), "10.4.9.0/24");
        assert_eq!(alloc.gateway, Ipv4Addr::new(10, 4, 9, 1));
        assert_eq!(alloc.host_address, Ipv4Addr::new(10, 4, 9, 7));
        assert_eq!(alloc.gateway_cidr(), "10.4.9.1/24");
    }

    #[test]
    fn test_default_range_matches_parsed_range() {
        let parsed = AddressAllocator::from_range(DEFAULT_RANGE_START, DEFAULT_RANGE_END).unwrap();
        let default = AddressAllocator::default_range();
        assert_eq!(parsed.capacity(), 65536);
        assert_eq!(parsed.capacity(), default.capacity());
        assert_eq!(parsed.first_block, default.first_block);
    }

    #[rstest]
    #[case("10.0.0", "10.255.255.255")]
    #[case("10.0.0.0", "not-an-ip")]
    #[case("::1", "10.0.0.0")]
    #[case("10.1.0.0", "10.0.0.0")]
    #[case("10.0.0.1", "10.0.0.255")]
    fn test_invalid_ranges(#[case] start: &str, #[case] end: &str) {
        assert!(matches!(
            AddressAllocator::from_range(start, end),
            Err(NetworkError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_unaligned_range_only_uses_whole_blocks() {
        let allocator = AddressAllocator::from_range("10.0.0.5", "10.0.3.10").unwrap();
        // 10.0.1.0/24 and 10.0.2.0/24 fit; 10.0.0.0 and 10.0.3.0 are partial.
        assert_eq!(allocator.capacity(), 2);

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let third = allocator.allocate(&mut rng).subnet.address.octets()[2];
            assert!(third == 1 || third == 2);
        }
    }

    #[test]
    fn test_allocate_free_skips_ledger_entries() {
        let allocator = AddressAllocator::from_range("10.0.0.0", "10.0.1.255").unwrap();
        let mut ledger = AllocationLedger::new();
        ledger
            .insert(record("br0", Ipv4Addr::new(10, 0, 0, 0)))
            .unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let alloc = allocator.allocate_free(&mut rng, &ledger).unwrap();
            assert_eq!(alloc.subnet.to_string(), "10.0.1.0/24");
        }
    }

    #[test]
    fn test_allocate_free_reports_exhaustion() {
        let allocator = AddressAllocator::from_range("10.0.0.0", "10.0.0.255").unwrap();
        let mut ledger = AllocationLedger::new();
        ledger
            .insert(record("br0", Ipv4Addr::new(10, 0, 0, 0)))
            .unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(
            allocator.allocate_free(&mut rng, &ledger),
            Err(NetworkError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_ledger_rejects_duplicates_and_releases() {
        let mut ledger = AllocationLedger::new();
        ledger
            .insert(record("br0", Ipv4Addr::new(10, 0, 0, 0)))
            .unwrap();

        assert_eq!(
            ledger.insert(record("br0", Ipv4Addr::new(10, 0, 1, 0))),
            Err(NetworkError::BridgeAlreadyAllocated("br0".to_string()))
        );
        assert!(matches!(
            ledger.insert(record("br1", Ipv4Addr::new(10, 0, 0, 0))),
            Err(NetworkError::PoolExhausted(_))
        ));
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get("br0").map(|r| r.allocation.subnet.address),
            Some(Ipv4Addr::new(10, 0, 0, 0))
        );
        assert!(ledger.get("br1").is_none());

        let released = ledger.release("br0").unwrap();
        assert_eq!(released.bridge_name, "br0");
        assert!(ledger.is_empty());
        assert!(!ledger.contains_subnet(&released.allocation.subnet));
        assert!(ledger.release("br0").is_none());
    }

    #[rstest]
    #[case("br0", true)]
    #[case("vmbr-01", true)]
    #[case("fifteen-chars15", true)]
    #[case("sixteen-chars-16", false)]
    #[case("", false)]
    #[case("..", false)]
    #[case("br/0", false)]
    #[case("br 0", false)]
    #[case("br:0", false)]
    fn test_validate_interface_name(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_interface_name(name).is_ok(), ok);
    }

    #[test]
    fn test_tap_names() {
        let names = TapNames::for_bridge("br0").unwrap();
        assert_eq!(names.first, "tap-br0-1");
        assert_eq!(names.second, "tap-br0-2");
        assert_eq!(names, TapNames::for_bridge("br0").unwrap());
        assert_eq!(names.as_array(), ["tap-br0-1", "tap-br0-2"]);
    }

    #[test]
    fn test_tap_names_reject_long_bridge() {
        assert!(TapNames::for_bridge("ninechars").is_ok());
        assert!(matches!(
            TapNames::for_bridge("tenchars10"),
            Err(NetworkError::InvalidInterfaceName { .. })
        ));
    }

    proptest! {
        #[test]
        fn allocation_stays_in_range_and_aligned(seed in any::<u64>()) {
            let allocator = AddressAllocator::from_range(DEFAULT_RANGE_START, DEFAULT_RANGE_END).unwrap();
            let range = Ipv4Prefix::from_cidr("10.0.0.0/8").unwrap();
            let alloc = allocator.allocate(&mut StdRng::seed_from_u64(seed));

            prop_assert!(range.contains(alloc.subnet.address));
            prop_assert_eq!(alloc.subnet.prefix_len, 24);
            prop_assert_eq!(alloc.subnet.address.octets()[3], 0);
            prop_assert_eq!(alloc.gateway.octets()[3], 1);
            prop_assert!(alloc.subnet.contains(alloc.gateway));
        }

        #[test]
        fn allocation_respects_arbitrary_ranges(start in any::<u32>(), len in 256u32..1 << 20, seed in any::<u64>()) {
            let end = start.saturating_add(len);
            let start_ip = Ipv4Addr::from(start).to_string();
            let end_ip = Ipv4Addr::from(end).to_string();
            if let Ok(allocator) = AddressAllocator::from_range(&start_ip, &end_ip) {
                let alloc = allocator.allocate(&mut StdRng::seed_from_u64(seed));
                let base = u32::from(alloc.subnet.address);
                prop_assert!(base >= start);
                prop_assert!(u64::from(base) + 255 <= u64::from(end));
                prop_assert_eq!(base % 256, 0);
            }
        }
    }
}

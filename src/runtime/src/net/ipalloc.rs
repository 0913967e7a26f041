//! Guest IP allocation over the bridge subnet.
//!
//! Hands out the lowest unused host address, skipping the network address,
//! the gateway (network + 1), and the broadcast address. The allocator does
//! not persist; at startup it is seeded from the reconstructed VM records.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use sandcastle_core::config::parse_cidr;
use sandcastle_core::error::{FleetError, Result};

/// Sequential IP allocator for a single subnet.
#[derive(Debug)]
pub struct IpAllocator {
    /// Network address (e.g. 10.20.1.0).
    network: Ipv4Addr,
    /// Prefix length (e.g. 24).
    prefix_len: u8,
    /// Gateway (network + 1).
    gateway: Ipv4Addr,
    /// Addresses currently leased.
    leased: BTreeSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Create an allocator from a CIDR string (e.g. "10.20.1.0/24").
    pub fn new(cidr: &str) -> Result<Self> {
        let (network, prefix_len) =
            parse_cidr(cidr).map_err(FleetError::Network)?;

        let gateway = Ipv4Addr::from(u32::from(network) + 1);

        Ok(Self {
            network,
            prefix_len,
            gateway,
            leased: BTreeSet::new(),
        })
    }

    /// The gateway address.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// The broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        let host_bits = 32 - self.prefix_len as u32;
        Ipv4Addr::from(u32::from(self.network) | ((1u32 << host_bits) - 1))
    }

    /// Number of usable guest addresses (network, gateway, broadcast excluded).
    pub fn capacity(&self) -> u32 {
        let host_bits = 32 - self.prefix_len as u32;
        ((1u32 << host_bits) - 1).saturating_sub(2)
    }

    /// Allocate the lowest unused address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let gateway = u32::from(self.gateway);
        let broadcast = u32::from(self.broadcast());

        let mut candidate = u32::from(self.network) + 2;
        while candidate < broadcast {
            if candidate != gateway {
                let ip = Ipv4Addr::from(candidate);
                if !self.leased.contains(&ip) {
                    self.leased.insert(ip);
                    return Ok(ip);
                }
            }
            candidate += 1;
        }

        Err(FleetError::ResourcesExhausted(format!(
            "no free addresses in {}/{}",
            self.network, self.prefix_len
        )))
    }

    /// Return an address to the pool. Idempotent.
    pub fn release(&mut self, ip: Ipv4Addr) {
        self.leased.remove(&ip);
    }

    /// Mark a set of addresses as leased (used when seeding from persisted
    /// VM records at startup).
    pub fn reserve(&mut self, addresses: impl IntoIterator<Item = Ipv4Addr>) {
        self.leased.extend(addresses);
    }

    /// Number of currently leased addresses.
    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocation_skips_gateway() {
        let mut alloc = IpAllocator::new("10.20.1.0/24").unwrap();
        assert_eq!(alloc.gateway(), Ipv4Addr::new(10, 20, 1, 1));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(10, 20, 1, 2));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(10, 20, 1, 3));
    }

    #[test]
    fn test_lowest_free_after_release() {
        let mut alloc = IpAllocator::new("10.20.1.0/24").unwrap();
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        alloc.release(a);
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut alloc = IpAllocator::new("10.20.1.0/24").unwrap();
        let a = alloc.allocate().unwrap();
        alloc.release(a);
        alloc.release(a);
        assert_eq!(alloc.leased_count(), 0);
    }

    #[test]
    fn test_exhaustion_at_capacity() {
        // /29 has 8 addresses: network, gateway, broadcast excluded → 5 usable.
        let mut alloc = IpAllocator::new("10.20.1.0/29").unwrap();
        assert_eq!(alloc.capacity(), 5);
        for _ in 0..5 {
            alloc.allocate().unwrap();
        }
        assert!(matches!(
            alloc.allocate(),
            Err(FleetError::ResourcesExhausted(_))
        ));
    }

    #[test]
    fn test_uniqueness() {
        let mut alloc = IpAllocator::new("10.20.1.0/28").unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Ok(ip) = alloc.allocate() {
            assert!(seen.insert(ip), "duplicate address {}", ip);
        }
        assert_eq!(seen.len(), alloc.capacity() as usize);
    }

    #[test]
    fn test_seeding_reserves_addresses() {
        let mut alloc = IpAllocator::new("10.20.1.0/24").unwrap();
        alloc.reserve([Ipv4Addr::new(10, 20, 1, 2), Ipv4Addr::new(10, 20, 1, 3)]);
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(10, 20, 1, 4));
    }

    #[test]
    fn test_broadcast_never_allocated() {
        let mut alloc = IpAllocator::new("10.20.1.0/29").unwrap();
        let broadcast = alloc.broadcast();
        while let Ok(ip) = alloc.allocate() {
            assert_ne!(ip, broadcast);
        }
    }
}

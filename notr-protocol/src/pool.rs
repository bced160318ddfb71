//! Virtual IP pool for tunnel clients
//!
//! Every client that completes authentication is assigned one host address
//! from the overlay network. For a /24 such as 100.64.0.0/24 the pool holds
//! 100.64.0.1 through 100.64.0.254; the network and broadcast addresses are
//! never handed out.
//!
//! All operations take one internal lock, so the pool can be shared behind
//! an `Arc` by every connection task without further synchronization.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::{Error, Result};

#[derive(Debug)]
struct PoolState {
    free: BTreeSet<Ipv4Addr>,
    in_use: HashSet<Ipv4Addr>,
}

/// IPv4 virtual address pool
#[derive(Debug)]
pub struct VipPool {
    net: Ipv4Net,
    total: usize,
    state: Mutex<PoolState>,
}

impl VipPool {
    /// Create a pool covering every host address of `net`
    pub fn new(net: Ipv4Net) -> Result<Self> {
        if net.prefix_len() > 30 {
            return Err(Error::InvalidCidr(format!(
                "{} has no usable host addresses (need at least /30)",
                net
            )));
        }

        let net = net.trunc();
        let begin = u32::from(net.network());
        let end = u32::from(net.broadcast());
        let free: BTreeSet<Ipv4Addr> = (begin + 1..end).map(Ipv4Addr::from).collect();

        Ok(Self {
            net,
            total: free.len(),
            state: Mutex::new(PoolState {
                free,
                in_use: HashSet::new(),
            }),
        })
    }

    /// Create from CIDR notation (e.g., "100.64.0.0/24")
    ///
    /// # Example
    /// ```
    /// use notr_protocol::VipPool;
    /// let pool = VipPool::from_cidr("192.168.10.0/24").unwrap();
    /// assert_eq!(pool.total(), 254);
    /// ```
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let cidr = cidr.trim();
        if cidr.contains(':') {
            return Err(Error::InvalidCidr(format!("{}: IPv6 is not supported", cidr)));
        }
        if !cidr.contains('/') {
            return Err(Error::InvalidCidr(format!("{}: missing prefix length", cidr)));
        }

        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| Error::InvalidCidr(format!("{}: {}", cidr, e)))?;
        Self::new(net)
    }

    /// Take a free address and mark it in use
    ///
    /// Returns [`Error::PoolExhausted`] without touching the pool when no
    /// address is free.
    pub fn select(&self) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();
        let vip = state.free.pop_first().ok_or(Error::PoolExhausted)?;
        state.in_use.insert(vip);
        Ok(vip)
    }

    /// Return an address to the free set
    ///
    /// Releasing an address that is not currently in use is a no-op and
    /// returns `false`.
    pub fn release(&self, vip: Ipv4Addr) -> bool {
        let mut state = self.state.lock();
        if !state.in_use.remove(&vip) {
            return false;
        }
        state.free.insert(vip);
        true
    }

    /// Check if an address is currently assigned
    pub fn is_in_use(&self, vip: Ipv4Addr) -> bool {
        self.state.lock().in_use.contains(&vip)
    }

    /// Number of addresses available for `select`
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of assigned addresses
    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Total number of host addresses in the pool
    pub fn total(&self) -> usize {
        self.total
    }

    /// Overlay network the pool was built from
    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    /// Overlay network in CIDR notation, as sent to clients
    pub fn cidr(&self) -> String {
        self.net.to_string()
    }

    /// Check the free/in-use invariant: disjoint sets whose union is the
    /// full host range
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let begin = u32::from(self.net.network());
        let end = u32::from(self.net.broadcast());

        state.free.len() + state.in_use.len() == self.total
            && state.in_use.iter().all(|ip| !state.free.contains(ip))
            && state
                .free
                .iter()
                .chain(state.in_use.iter())
                .all(|ip| (begin + 1..end).contains(&u32::from(*ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vip_pool_creation() {
        let pool = VipPool::from_cidr("10.1.1.0/24").unwrap();
        assert_eq!(pool.total(), 254);
        assert_eq!(pool.available(), 254);
        assert_eq!(pool.cidr(), "10.1.1.0/24");
    }

    #[test]
    fn test_vip_pool_host_bits_truncated() {
        let pool = VipPool::from_cidr("10.1.1.77/24").unwrap();
        assert_eq!(pool.network().network(), Ipv4Addr::new(10, 1, 1, 0));
        assert_eq!(pool.select().unwrap(), Ipv4Addr::new(10, 1, 1, 1));
    }

    #[test]
    fn test_vip_pool_rejects_bad_input() {
        for bad in ["fd00::/64", "10.1.1.0", "10.1.1.0/33", "10.1.1/24", "garbage", "10.1.1.0/31", "10.1.1.0/32"] {
            assert!(
                matches!(VipPool::from_cidr(bad), Err(Error::InvalidCidr(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_vip_pool_smallest_subnet() {
        let pool = VipPool::from_cidr("10.0.0.0/30").unwrap();
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.select().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pool.select().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(pool.select(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_vip_pool_release() {
        let pool = VipPool::from_cidr("10.0.0.0/29").unwrap();
        let vip = pool.select().unwrap();
        assert!(pool.is_in_use(vip));

        assert!(pool.release(vip));
        assert!(!pool.is_in_use(vip));
        assert!(!pool.release(vip));
        assert!(!pool.release(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(pool.is_consistent());
    }

    #[test]
    fn test_vip_pool_exhausted_does_not_mutate() {
        let pool = VipPool::from_cidr("10.0.0.0/29").unwrap();
        while pool.select().is_ok() {}

        for _ in 0..3 {
            assert!(pool.select().unwrap_err().is_exhaustion());
            assert_eq!(pool.available(), 0);
            assert_eq!(pool.in_use_count(), 6);
            assert!(pool.is_consistent());
        }
    }
}

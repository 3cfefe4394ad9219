//! IPv4 address management for microVM networking.
//!
//! This library provides:
//! - CIDR parsing and usable-range arithmetic (`cidr`)
//! - Bitmap-backed address pools with reservations (`pool`)
//! - A thread-safe manager over many named pools, including splitting a
//!   large subnet into many small per-VM child pools

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

pub mod cidr;
mod pool;

pub use cidr::Ipv4Cidr;
pub use pool::IpPool;

/// Largest child prefix accepted by [`IpPoolManager::split_into_sub_pools`].
pub const MAX_SPLIT_PREFIX: u8 = 30;

/// IPAM errors.
#[derive(Debug, Error)]
pub enum IpamError {
    /// A pool with this name already exists.
    #[error("pool already exists: {0}")]
    DuplicatePool(String),

    /// No pool with this name.
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// Every usable address is allocated.
    #[error("no available IP in pool: {0}")]
    NoAvailableIp(String),

    /// Release or reservation of an address the pool cannot accept.
    #[error("invalid release of {address} in pool {pool}: {reason}")]
    InvalidRelease {
        pool: String,
        address: Ipv4Addr,
        reason: String,
    },

    /// Malformed, non-IPv4 or oversized CIDR.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Child prefix not usable for splitting.
    #[error("invalid split: {0}")]
    InvalidSplit(String),
}

/// Usage statistics of one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct IpPoolStats {
    pub pool_name: String,
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub total_usable: usize,
    pub allocated: usize,
    pub free: usize,
}

impl IpPoolStats {
    /// Fraction of usable addresses currently allocated.
    pub fn utilization(&self) -> f64 {
        if self.total_usable == 0 {
            0.0
        } else {
            self.allocated as f64 / self.total_usable as f64
        }
    }
}

/// Thread-safe manager of named IPv4 pools.
///
/// Pool names are case-insensitive. Iteration order (and therefore the result
/// of [`IpPoolManager::find_available_pool`]) follows the sorted pool names.
#[derive(Debug, Default)]
pub struct IpPoolManager {
    pools: RwLock<BTreeMap<String, Arc<IpPool>>>,
}

impl IpPoolManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool built from `cidr`, with optional reserved addresses.
    pub fn add_pool(&self, name: &str, cidr: &str, reserved: &[Ipv4Addr]) -> Result<(), IpamError> {
        let key = normalize(name);
        let pool = IpPool::new(&key, cidr.parse()?, reserved)?;

        let mut pools = self.write();
        if pools.contains_key(&key) {
            return Err(IpamError::DuplicatePool(key));
        }
        pools.insert(key, Arc::new(pool));
        Ok(())
    }

    /// Allocate an address from a pool.
    pub fn allocate(&self, name: &str) -> Result<Ipv4Addr, IpamError> {
        self.get(name)?.allocate()
    }

    /// Allocate an address, returning `Ok(None)` when the pool is exhausted.
    pub fn try_allocate(&self, name: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        Ok(self.get(name)?.try_allocate())
    }

    /// Release a previously allocated address.
    pub fn release(&self, name: &str, address: Ipv4Addr) -> Result<(), IpamError> {
        self.get(name)?.release(address)
    }

    /// Permanently reserve an address; it counts as allocated from now on.
    pub fn reserve(&self, name: &str, address: Ipv4Addr) -> Result<(), IpamError> {
        self.get(name)?.reserve(address)
    }

    /// Free every non-reserved address of a pool.
    pub fn release_all(&self, name: &str) -> Result<(), IpamError> {
        self.get(name)?.release_all();
        Ok(())
    }

    /// Usage statistics for a pool.
    pub fn stats(&self, name: &str) -> Result<IpPoolStats, IpamError> {
        let pool = self.get(name)?;
        let allocated = pool.allocated_count();
        Ok(IpPoolStats {
            pool_name: pool.name().to_string(),
            network: pool.cidr().network(),
            prefix_len: pool.cidr().prefix_len(),
            total_usable: pool.usable_count(),
            allocated,
            free: pool.usable_count() - allocated,
        })
    }

    /// Names of all pools.
    pub fn list_pools(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Partition a pool into the maximal number of `/sub_prefix` child pools.
    ///
    /// Children are named `{parent}-{network}/{sub_prefix}`. Children whose
    /// name already exists are skipped. The parent is removed unless
    /// `keep_parent` is set. Returns the names of the created children.
    pub fn split_into_sub_pools(
        &self,
        name: &str,
        sub_prefix: u8,
        keep_parent: bool,
    ) -> Result<Vec<String>, IpamError> {
        let parent = self.get(name)?;
        let parent_cidr = parent.cidr();

        if sub_prefix <= parent_cidr.prefix_len() {
            return Err(IpamError::InvalidSplit(format!(
                "child prefix /{} must be more specific than parent /{}",
                sub_prefix,
                parent_cidr.prefix_len()
            )));
        }
        if sub_prefix > MAX_SPLIT_PREFIX {
            return Err(IpamError::InvalidSplit(format!(
                "child prefix /{} exceeds /{}",
                sub_prefix, MAX_SPLIT_PREFIX
            )));
        }

        let child_size = 1u64 << (32 - sub_prefix as u32);
        let mut created = Vec::new();

        let mut pools = self.write();
        let mut offset = 0u64;
        while offset < parent_cidr.size() {
            let network = Ipv4Addr::from(parent_cidr.network_u32() + offset as u32);
            offset += child_size;

            let child_cidr = Ipv4Cidr::new(network, sub_prefix)?;
            let child_name = normalize(&format!("{}-{}", parent.name(), child_cidr));
            if pools.contains_key(&child_name) {
                continue;
            }

            let pool = IpPool::new(&child_name, child_cidr, &[])?;
            pools.insert(child_name.clone(), Arc::new(pool));
            created.push(child_name);
        }

        if !keep_parent {
            pools.remove(parent.name());
        }

        Ok(created)
    }

    /// First pool with at least `min_free` free addresses (minimum 1).
    pub fn find_available_pool(&self, min_free: usize) -> Option<String> {
        let min_free = min_free.max(1);
        self.read()
            .iter()
            .find(|(_, pool)| pool.usable_count() - pool.allocated_count() >= min_free)
            .map(|(name, _)| name.clone())
    }

    fn get(&self, name: &str) -> Result<Arc<IpPool>, IpamError> {
        let key = normalize(name);
        self.read()
            .get(&key)
            .cloned()
            .ok_or(IpamError::PoolNotFound(key))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<IpPool>>> {
        self.pools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<IpPool>>> {
        self.pools.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    proptest! {
        #[test]
        fn allocations_are_unique_and_usable(prefix in 24u8..=30, count in 1usize..300) {
            let mgr = IpPoolManager::new();
            let cidr = format!("10.20.0.0/{}", prefix);
            mgr.add_pool("prop", &cidr, &[]).unwrap();

            let parsed: Ipv4Cidr = cidr.parse().unwrap();
            let (first, last) = parsed.usable_range();
            let usable = (last - first) as usize + 1;

            let mut seen = HashSet::new();
            for _ in 0..count {
                match mgr.try_allocate("prop").unwrap() {
                    Some(addr) => {
                        let value = u32::from(addr);
                        prop_assert!(value >= first && value <= last);
                        prop_assert!(seen.insert(addr));
                    }
                    None => prop_assert_eq!(seen.len(), usable),
                }
            }
            prop_assert_eq!(mgr.stats("prop").unwrap().allocated, seen.len());
        }
    }
}

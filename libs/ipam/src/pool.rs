//! A single IPv4 pool backed by an allocation bitmap.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use crate::cidr::{Ipv4Cidr, MIN_POOL_PREFIX};
use crate::IpamError;

/// Fixed-size bitmap, one bit per usable host address.
#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize, value: bool) {
        let bit = 1u64 << (idx % 64);
        if value {
            self.words[idx / 64] |= bit;
        } else {
            self.words[idx / 64] &= !bit;
        }
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Debug)]
struct PoolState {
    allocated: Bitmap,
    reserved: HashSet<u32>,
    next_search: usize,
}

/// IPv4 pool carved from one CIDR block.
///
/// Every reserved address has its bit set for the lifetime of the pool.
#[derive(Debug)]
pub struct IpPool {
    name: String,
    cidr: Ipv4Cidr,
    first_usable: u32,
    usable_count: usize,
    state: Mutex<PoolState>,
}

impl IpPool {
    /// Build a pool. Reserved addresses outside the usable range are ignored.
    pub fn new(name: &str, cidr: Ipv4Cidr, reserved: &[Ipv4Addr]) -> Result<Self, IpamError> {
        if cidr.prefix_len() < MIN_POOL_PREFIX {
            return Err(IpamError::InvalidCidr(format!(
                "{} is too large, minimum prefix is /{}",
                cidr, MIN_POOL_PREFIX
            )));
        }

        let (first, last) = cidr.usable_range();
        let usable_count = (last - first) as usize + 1;

        let mut state = PoolState {
            allocated: Bitmap::new(usable_count),
            reserved: HashSet::new(),
            next_search: 0,
        };

        for addr in reserved {
            let value = u32::from(*addr);
            if value < first || value > last {
                continue;
            }
            state.allocated.set((value - first) as usize, true);
            state.reserved.insert(value);
        }

        Ok(Self {
            name: name.to_string(),
            cidr,
            first_usable: first,
            usable_count,
            state: Mutex::new(state),
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Network this pool was built from.
    pub fn cidr(&self) -> Ipv4Cidr {
        self.cidr
    }

    /// Number of usable host addresses.
    pub fn usable_count(&self) -> usize {
        self.usable_count
    }

    /// Number of allocated addresses, reserved ones included.
    pub fn allocated_count(&self) -> usize {
        self.lock().allocated.count_ones()
    }

    /// Allocate the next free address, scanning circularly from the cursor.
    pub fn allocate(&self) -> Result<Ipv4Addr, IpamError> {
        self.try_allocate()
            .ok_or_else(|| IpamError::NoAvailableIp(self.name.clone()))
    }

    /// Non-failing form of [`IpPool::allocate`].
    pub fn try_allocate(&self) -> Option<Ipv4Addr> {
        let mut state = self.lock();
        for i in 0..self.usable_count {
            let idx = (state.next_search + i) % self.usable_count;
            if !state.allocated.get(idx) {
                state.allocated.set(idx, true);
                state.next_search = (idx + 1) % self.usable_count;
                return Some(Ipv4Addr::from(self.first_usable + idx as u32));
            }
        }
        None
    }

    /// Return an allocated address to the pool.
    pub fn release(&self, address: Ipv4Addr) -> Result<(), IpamError> {
        let idx = self.index_of(address)?;
        let value = u32::from(address);

        let mut state = self.lock();
        if state.reserved.contains(&value) {
            return Err(self.invalid_release(address, "address is reserved"));
        }
        if !state.allocated.get(idx) {
            return Err(self.invalid_release(address, "address was not allocated"));
        }

        state.allocated.set(idx, false);
        // Move the cursor back so the freed address is handed out first.
        if idx < state.next_search {
            state.next_search = idx;
        }
        Ok(())
    }

    /// Permanently mark an address as allocated and reserved.
    pub fn reserve(&self, address: Ipv4Addr) -> Result<(), IpamError> {
        let idx = self.index_of(address)?;

        let mut state = self.lock();
        state.allocated.set(idx, true);
        state.reserved.insert(u32::from(address));
        Ok(())
    }

    /// Free every allocated address except reserved ones.
    pub fn release_all(&self) {
        let mut state = self.lock();
        for idx in 0..self.usable_count {
            let value = self.first_usable + idx as u32;
            if !state.reserved.contains(&value) {
                state.allocated.set(idx, false);
            }
        }
        state.next_search = 0;
    }

    fn index_of(&self, address: Ipv4Addr) -> Result<usize, IpamError> {
        let value = u32::from(address);
        if value < self.first_usable || value - self.first_usable >= self.usable_count as u32 {
            return Err(self.invalid_release(address, "address not inside pool"));
        }
        Ok((value - self.first_usable) as usize)
    }

    fn invalid_release(&self, address: Ipv4Addr, reason: &str) -> IpamError {
        IpamError::InvalidRelease {
            pool: self.name.clone(),
            address,
            reason: reason.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! IPv4 CIDR parsing and arithmetic.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::IpamError;

/// Smallest prefix a pool may be built from.
pub const MIN_POOL_PREFIX: u8 = 8;

/// An IPv4 network in CIDR notation, masked to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a CIDR from an address and prefix length.
    ///
    /// Host bits of `address` are cleared.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, IpamError> {
        if prefix_len > 32 {
            return Err(IpamError::InvalidCidr(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            network: u32::from(address) & prefix_mask(prefix_len),
            prefix_len,
        })
    }

    /// Network address as an integer.
    pub fn network_u32(&self) -> u32 {
        self.network
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Prefix length (e.g. 30 for a /30).
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Total number of addresses covered, including network and broadcast.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len as u32)
    }

    /// Check if an address is inside this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & prefix_mask(self.prefix_len) == self.network
    }

    /// First and last usable host addresses (inclusive).
    ///
    /// Network and broadcast addresses are excluded, except for /31
    /// (point-to-point, RFC 3021) and /32 where every address is usable.
    pub fn usable_range(&self) -> (u32, u32) {
        let last = self.network + (self.size() - 1) as u32;
        if self.prefix_len >= 31 {
            (self.network, last)
        } else {
            (self.network + 1, last - 1)
        }
    }
}

impl FromStr for Ipv4Cidr {
    type Err = IpamError;

    /// Parse from CIDR notation (e.g. "10.0.0.0/30").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(IpamError::InvalidCidr(format!("missing '/' in CIDR: {}", s)));
        };

        let address = match IpAddr::from_str(addr_str.trim()) {
            Ok(IpAddr::V4(v4)) => v4,
            Ok(IpAddr::V6(_)) => {
                return Err(IpamError::InvalidCidr(format!(
                    "only IPv4 CIDRs are supported: {}",
                    s
                )))
            }
            Err(_) => {
                return Err(IpamError::InvalidCidr(format!("invalid address in CIDR: {}", s)))
            }
        };

        let prefix_len = prefix_str
            .trim()
            .parse::<u8>()
            .map_err(|_| IpamError::InvalidCidr(format!("invalid prefix in CIDR: {}", s)))?;

        Self::new(address, prefix_len)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

/// Netmask for a prefix length.
pub fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_masks_host_bits() {
        let cidr: Ipv4Cidr = "10.0.0.7/30".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(cidr.prefix_len(), 30);
        assert_eq!(cidr.to_string(), "10.0.0.4/30");
    }

    #[rstest]
    #[case("10.0.0.0")]
    #[case("10.0.0/24")]
    #[case("10.0.0.0/33")]
    #[case("10.0.0.0/abc")]
    #[case("fd00::/64")]
    #[case("")]
    fn test_parse_rejects_malformed(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Ipv4Cidr>(),
            Err(IpamError::InvalidCidr(_))
        ));
    }

    #[rstest]
    #[case("10.0.0.0/30", (1, 2))]
    #[case("10.0.0.0/31", (0, 1))]
    #[case("10.0.0.5/32", (5, 5))]
    #[case("10.0.0.0/24", (1, 254))]
    fn test_usable_range(#[case] input: &str, #[case] expected: (u32, u32)) {
        let cidr: Ipv4Cidr = input.parse().unwrap();
        let (first, last) = cidr.usable_range();
        assert_eq!(first - cidr.network_u32(), expected.0);
        assert_eq!(last - cidr.network_u32(), expected.1);
    }

    #[test]
    fn test_contains() {
        let cidr: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }
}

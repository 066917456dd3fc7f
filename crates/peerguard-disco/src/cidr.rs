//! IP network (CIDR) matching
//!
//! Used for the ignored-local-CIDR filters of discovery: the overlay's own
//! prefixes and any operator-supplied ranges are never advertised or probed.

use std::net::IpAddr;
use std::str::FromStr;

use crate::error::DiscoError;

/// IP network specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl IpNetwork {
    /// Create a new IP network
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Check if an IP falls within this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - self.prefix_len);
                u32::from(net) & mask == u32::from(target) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u128 << (128 - self.prefix_len);
                u128::from(net) & mask == u128::from(target) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = DiscoError;

    /// Parse `"10.0.0.0/8"` / `"fd00::/64"`. A bare address is a host network.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DiscoError::Config(format!("unparseable CIDR: {s}"));
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let address: IpAddr = addr.parse().map_err(|_| bad())?;
                let prefix_len: u8 = prefix.parse().map_err(|_| bad())?;
                let max = match address {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if prefix_len > max {
                    return Err(bad());
                }
                Ok(Self::new(address, prefix_len))
            }
            None => {
                let address: IpAddr = s.parse().map_err(|_| bad())?;
                let prefix_len = match address {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                Ok(Self::new(address, prefix_len))
            }
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn contains_v4() {
        let net: IpNetwork = "100.99.0.0/24".parse().unwrap();
        assert!(net.contains(IpAddr::V4(Ipv4Addr::new(100, 99, 0, 42))));
        assert!(!net.contains(IpAddr::V4(Ipv4Addr::new(100, 98, 0, 42))));
        assert!(!net.contains(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn contains_v6() {
        let net: IpNetwork = "fd00::/64".parse().unwrap();
        assert!(net.contains("fd00::1".parse().unwrap()));
        assert!(!net.contains("fd01::1".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let net: IpNetwork = "0.0.0.0/0".parse().unwrap();
        assert!(net.contains(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn bare_address_is_host_network() {
        let net: IpNetwork = "10.1.2.3".parse().unwrap();
        assert_eq!(net.prefix_len, 32);
        assert!(net.contains(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(!net.contains(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 4))));
    }

    #[test]
    fn rejects_garbage() {
        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("not-a-cidr".parse::<IpNetwork>().is_err());
    }
}

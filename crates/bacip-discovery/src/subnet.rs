//! IPv4 subnet arithmetic and host enumeration

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubnetError {
    #[error("prefix length {0} is larger than 32")]
    PrefixTooLong(u8),
    #[error("netmask {0} is not contiguous")]
    InvalidNetmask(Ipv4Addr),
    #[error("invalid subnet {0:?}, expected a.b.c.d/prefix")]
    Parse(String),
}

/// An address plus prefix length. The address is kept as given (usually the
/// local interface address); [`Subnet::network`] yields the masked base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, SubnetError> {
        if prefix_len > 32 {
            return Err(SubnetError::PrefixTooLong(prefix_len));
        }
        Ok(Self { address, prefix_len })
    }

    /// Build from an address and a dotted netmask such as 255.255.255.0
    pub fn from_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, SubnetError> {
        let mask = u32::from(netmask);
        let prefix_len = mask.leading_ones();
        // Every set bit must be part of the leading run
        if mask.count_ones() != prefix_len {
            return Err(SubnetError::InvalidNetmask(netmask));
        }
        Self::new(address, prefix_len as u8)
    }

    /// Classful default mask, used when an interface reports no netmask
    pub fn with_default_mask(address: Ipv4Addr) -> Self {
        let prefix_len = match address.octets()[0] {
            0..=127 => 8,
            128..=191 => 16,
            192..=223 => 24,
            _ => 32,
        };
        Self { address, prefix_len }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix_len)
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    /// All-zero host address
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// All-ones host address
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == (u32::from(self.address) & self.mask())
    }

    /// Number of usable hosts: 2^(32-prefix) - 2, zero for /31 and /32
    pub fn host_count(&self) -> u64 {
        if self.prefix_len >= 31 {
            0
        } else {
            (1u64 << (32 - self.prefix_len)) - 2
        }
    }

    /// Usable host addresses in ascending order, skipping network and broadcast
    pub fn hosts(&self) -> HostIter {
        HostIter::new(*self)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| SubnetError::Parse(s.to_string()))?;
        let address = address
            .parse()
            .map_err(|_| SubnetError::Parse(s.to_string()))?;
        let prefix_len = prefix
            .parse()
            .map_err(|_| SubnetError::Parse(s.to_string()))?;
        Self::new(address, prefix_len)
    }
}

/// Increment a big-endian address by one, carrying across octets.
/// Returns false when the address wrapped around to 0.0.0.0.
fn increment(octets: &mut [u8; 4]) -> bool {
    for octet in octets.iter_mut().rev() {
        *octet = octet.wrapping_add(1);
        if *octet != 0 {
            return true;
        }
    }
    false
}

/// Host iterator. The working buffer stays private; every item is a fresh
/// `Ipv4Addr` value.
#[derive(Debug, Clone)]
pub struct HostIter {
    subnet: Subnet,
    broadcast: Ipv4Addr,
    current: Option<[u8; 4]>,
}

impl HostIter {
    fn new(subnet: Subnet) -> Self {
        let mut first = subnet.network().octets();
        let current = increment(&mut first).then_some(first);
        Self {
            subnet,
            broadcast: subnet.broadcast(),
            current,
        }
    }
}

impl Iterator for HostIter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let candidate = self.current?;
        let ip = Ipv4Addr::from(candidate);
        if !self.subnet.contains(ip) || ip == self.broadcast {
            self.current = None;
            return None;
        }

        let mut working = candidate;
        self.current = increment(&mut working).then_some(working);
        Some(ip)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.current {
            None => (0, Some(0)),
            Some(current) => {
                let current = u32::from(Ipv4Addr::from(current));
                let remaining = u32::from(self.broadcast).saturating_sub(current) as usize;
                (0, Some(remaining))
            }
        }
    }
}

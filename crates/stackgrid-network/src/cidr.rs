//! IPv4 CIDR arithmetic.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TopologyError;

/// An IPv4 network block. Host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, TopologyError> {
        if prefix > 32 {
            return Err(TopologyError::InvalidCidr(format!("{addr}/{prefix}")));
        }
        let bits = u32::from(addr);
        if bits & !mask(prefix) != 0 {
            return Err(TopologyError::InvalidCidr(format!(
                "{addr}/{prefix} has host bits set"
            )));
        }
        Ok(Self {
            network: bits,
            prefix,
        })
    }

    /// `0.0.0.0/0`.
    pub fn any() -> Self {
        Self {
            network: 0,
            prefix: 0,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn last(&self) -> u32 {
        self.network | !mask(self.prefix)
    }

    pub fn is_default_route(&self) -> bool {
        self.prefix == 0
    }

    /// True when `other` lies entirely within `self`.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        self.prefix <= other.prefix && other.network & mask(self.prefix) == self.network
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.network <= other.last() && other.network <= self.last()
    }

    /// The `index`-th block of size `/new_prefix` inside `self`.
    pub fn subdivide(&self, new_prefix: u8, index: u32) -> Result<Ipv4Cidr, TopologyError> {
        if new_prefix < self.prefix || new_prefix > 32 {
            return Err(TopologyError::SubnetPrefix {
                prefix: new_prefix,
                base: self.prefix,
            });
        }
        let available = 1u64 << u32::from(new_prefix - self.prefix);
        if u64::from(index) >= available {
            return Err(TopologyError::Capacity {
                cidr: self.to_string(),
                subnets: index + 1,
                prefix: new_prefix,
            });
        }
        let step = 1u64 << (32 - u32::from(new_prefix));
        let network = u64::from(self.network) + u64::from(index) * step;
        Ok(Self {
            network: network as u32,
            prefix: new_prefix,
        })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| TopologyError::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| TopologyError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| TopologyError::InvalidCidr(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

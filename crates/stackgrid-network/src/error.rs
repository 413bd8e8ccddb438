//! Network builder errors.

use stackgrid_cloud::CloudError;
use stackgrid_core::SubnetRole;
use thiserror::Error;

/// A malformed network, subnet or isolation spec. Always raised before
/// any resource is created.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("zone count {requested} outside {min}..={max}")]
    ZoneCount { requested: u8, min: u8, max: u8 },

    #[error("no {0} subnet requested")]
    MissingRole(SubnetRole),

    #[error("duplicate subnet name: {0}")]
    DuplicateSubnetName(String),

    #[error("subnet prefix /{prefix} is shorter than the fabric prefix /{base}")]
    SubnetPrefix { prefix: u8, base: u8 },

    #[error("{subnets} subnets do not fit in {cidr} at /{prefix}")]
    Capacity { cidr: String, subnets: u32, prefix: u8 },

    #[error("subnets {a} and {b} overlap")]
    Overlap { a: String, b: String },

    #[error("subnet {subnet} lies outside {cidr}")]
    OutsideFabric { subnet: String, cidr: String },

    #[error("private subnet {subnet} has a default route to the internet")]
    PublicRouteOnPrivate { subnet: String },

    #[error("isolation policy violation: {0}")]
    Policy(String),

    #[error("boundary {boundary} references {peer}, which does not exist yet")]
    UnresolvedPeer { boundary: String, peer: String },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

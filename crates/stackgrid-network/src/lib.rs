//! stackgrid-network — network fabric and isolation policy builders.
//!
//! Plans an isolated virtual network with public and private subnets
//! across fault-isolation zones, with no NAT egress path: private
//! resources reach the registry and object storage only through explicit
//! private endpoints. On top of the fabric sits a small graph of
//! isolation boundaries (edge, internal-egress, workload) whose rules
//! reference each other by identity.
//!
//! # Components
//!
//! - **`cidr`** — IPv4 CIDR arithmetic (containment, overlap, subdivision)
//! - **`fabric`** — subnet allocation, route tables, self-verification
//! - **`endpoints`** — interface and gateway private endpoints
//! - **`isolation`** — boundary specs, validation, identity resolution
//! - **`provision`** — materializes all of the above through a `Scope`
//!
//! Everything except `provision` is pure and runs at plan time, so a
//! malformed topology is rejected before any resource exists.

pub mod cidr;
pub mod endpoints;
pub mod error;
pub mod fabric;
pub mod isolation;
pub mod provision;

pub use cidr::Ipv4Cidr;
pub use endpoints::{EndpointKind, EndpointSpec, ProvisionedEndpoint};
pub use error::{NetworkError, NetworkResult, TopologyError};
pub use fabric::{FabricSpec, NatStrategy, NetworkFabric, ProvisionedFabric, Route, SubnetPlan};
pub use isolation::{
    BoundaryRole, BoundarySpec, Direction, IsolationBoundary, IsolationPolicy, MaterializedRule,
    Peer, PortRange, Protocol, ResolvedPeer, ResolvedRule, RuleSpec,
};

//! Shared types used across StackGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime identity assigned to a resource by the cloud provider.
///
/// Only known after creation, which is why consumers reference producers
/// through graph nodes rather than through ids written into the config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Every resource kind the fixed topology is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Subnet,
    RouteTable,
    InternetGateway,
    Boundary,
    BoundaryRule,
    PrivateEndpoint,
    Certificate,
    DnsRecord,
    LoadBalancer,
    TargetPool,
    Listener,
    LogSink,
    ExecutionRole,
    Cluster,
    Image,
    WorkloadDefinition,
    ManagedService,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::InternetGateway => "internet_gateway",
            ResourceKind::Boundary => "boundary",
            ResourceKind::BoundaryRule => "boundary_rule",
            ResourceKind::PrivateEndpoint => "private_endpoint",
            ResourceKind::Certificate => "certificate",
            ResourceKind::DnsRecord => "dns_record",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::TargetPool => "target_pool",
            ResourceKind::Listener => "listener",
            ResourceKind::LogSink => "log_sink",
            ResourceKind::ExecutionRole => "execution_role",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Image => "image",
            ResourceKind::WorkloadDefinition => "workload_definition",
            ResourceKind::ManagedService => "managed_service",
        }
    }

    /// Short prefix used when minting runtime ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Network => "net",
            ResourceKind::Subnet => "subnet",
            ResourceKind::RouteTable => "rtb",
            ResourceKind::InternetGateway => "igw",
            ResourceKind::Boundary => "bnd",
            ResourceKind::BoundaryRule => "bndr",
            ResourceKind::PrivateEndpoint => "pe",
            ResourceKind::Certificate => "cert",
            ResourceKind::DnsRecord => "rr",
            ResourceKind::LoadBalancer => "lb",
            ResourceKind::TargetPool => "tp",
            ResourceKind::Listener => "lsn",
            ResourceKind::LogSink => "log",
            ResourceKind::ExecutionRole => "role",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Image => "img",
            ResourceKind::WorkloadDefinition => "wd",
            ResourceKind::ManagedService => "svc",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement role of a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetRole {
    /// Routed to the internet gateway. Hosts the edge router only.
    Public,
    /// No default route. Hosts workload replicas and private endpoints.
    Private,
}

impl SubnetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetRole::Public => "public",
            SubnetRole::Private => "private",
        }
    }
}

impl fmt::Display for SubnetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceKind::WorkloadDefinition).unwrap();
        assert_eq!(json, "\"workload_definition\"");
        assert_eq!(ResourceKind::WorkloadDefinition.as_str(), "workload_definition");
    }

    #[test]
    fn resource_id_is_transparent() {
        let id = ResourceId::new("lb-0001");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"lb-0001\"");
        assert_eq!(id.to_string(), "lb-0001");
    }
}

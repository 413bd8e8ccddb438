//! Private endpoints for a fabric without NAT.
//!
//! Private subnets have no route to the internet, so everything a
//! workload pulls at startup must be reachable through an endpoint:
//! the registry API and image layers through interface endpoints placed
//! in private subnets behind the internal-egress boundary, and object
//! storage through a gateway endpoint that owns a prefix-list route in
//! every private route table.

use serde::{Deserialize, Serialize};
use stackgrid_core::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Network interfaces in private subnets, guarded by a boundary.
    Interface,
    /// Route-table entry towards a provider-managed prefix list.
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub service: String,
    pub kind: EndpointKind,
    /// Resolve the service's public hostname to the endpoint.
    pub private_dns: bool,
}

impl EndpointSpec {
    /// Prefix-list identifier for a gateway endpoint's route.
    pub fn prefix_list(&self) -> String {
        format!("pl-{}", self.service)
    }
}

/// The endpoints a workload needs to pull its image with no internet path.
pub fn default_endpoints(region: &str) -> Vec<EndpointSpec> {
    vec![
        EndpointSpec {
            name: "registry-api".to_string(),
            service: format!("{region}.registry.api"),
            kind: EndpointKind::Interface,
            private_dns: true,
        },
        EndpointSpec {
            name: "registry-layers".to_string(),
            service: format!("{region}.registry.layers"),
            kind: EndpointKind::Interface,
            private_dns: true,
        },
        EndpointSpec {
            name: "object-storage".to_string(),
            service: format!("{region}.object-storage"),
            kind: EndpointKind::Gateway,
            private_dns: false,
        },
    ]
}

/// Gateway services out of a list of endpoint specs.
pub fn gateway_services(specs: &[EndpointSpec]) -> Vec<String> {
    specs
        .iter()
        .filter(|s| s.kind == EndpointKind::Gateway)
        .map(|s| s.service.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEndpoint {
    pub spec: EndpointSpec,
    pub id: ResourceId,
    /// Subnets an interface endpoint lives in.
    pub subnet_ids: Vec<ResourceId>,
    /// Route tables a gateway endpoint is associated with.
    pub route_table_ids: Vec<ResourceId>,
    pub boundary_id: Option<ResourceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_registry_and_storage() {
        let specs = default_endpoints("eu-west-1");
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs
                .iter()
                .filter(|s| s.kind == EndpointKind::Interface)
                .count(),
            2
        );
        assert_eq!(gateway_services(&specs), vec!["eu-west-1.object-storage"]);
    }

    #[test]
    fn gateway_prefix_list_name() {
        let specs = default_endpoints("us-east-2");
        let gateway = specs
            .iter()
            .find(|s| s.kind == EndpointKind::Gateway)
            .unwrap();
        assert_eq!(gateway.prefix_list(), "pl-us-east-2.object-storage");
    }
}

//! Materializes planned network resources through a [`Scope`].
//!
//! Every call waits for the resource to be ready before returning, so the
//! outputs here are safe to hand to consumers.

use std::collections::BTreeMap;

use serde_json::json;
use stackgrid_cloud::Scope;
use stackgrid_core::{ResourceKind, SubnetRole};
use tracing::{debug, info};

use crate::endpoints::{EndpointKind, EndpointSpec, ProvisionedEndpoint};
use crate::error::{NetworkResult, TopologyError};
use crate::fabric::{NetworkFabric, ProvisionedFabric, ProvisionedSubnet};
use crate::isolation::{
    BoundaryRole, BoundarySpec, IsolationBoundary, IsolationPolicy, MaterializedRule,
    resolve_rule,
};

/// Create the network, its internet gateway, and one route table plus
/// subnet per planned subnet.
pub async fn provision_fabric(
    scope: &Scope<'_>,
    fabric: &NetworkFabric,
) -> NetworkResult<ProvisionedFabric> {
    fabric.verify()?;

    let network = scope
        .create(
            ResourceKind::Network,
            &fabric.name,
            json!({
                "cidr": fabric.cidr,
                "zones": fabric.zones,
                "enable_dns_hostnames": fabric.enable_dns,
                "enable_dns_support": fabric.enable_dns,
                "nat": fabric.nat,
            }),
        )
        .await?;

    let gateway = scope
        .create(
            ResourceKind::InternetGateway,
            &format!("{}-igw", fabric.name),
            json!({ "network_id": network.id }),
        )
        .await?;

    let mut subnets = Vec::with_capacity(fabric.subnets.len());
    for plan in &fabric.subnets {
        let internet_gateway_id = match plan.role {
            SubnetRole::Public => Some(&gateway.id),
            SubnetRole::Private => None,
        };
        let table = scope
            .create(
                ResourceKind::RouteTable,
                &format!("{}-rt", plan.name),
                json!({
                    "network_id": network.id,
                    "routes": plan.routes,
                    "internet_gateway_id": internet_gateway_id,
                }),
            )
            .await?;
        let subnet = scope
            .create(
                ResourceKind::Subnet,
                &plan.name,
                json!({
                    "network_id": network.id,
                    "cidr": plan.cidr,
                    "zone": plan.zone,
                    "role": plan.role,
                    "route_table_id": table.id,
                    "map_public_ip": plan.role == SubnetRole::Public,
                }),
            )
            .await?;
        debug!(subnet = %plan.name, cidr = %plan.cidr, role = %plan.role, "subnet ready");
        subnets.push(ProvisionedSubnet {
            plan: plan.clone(),
            id: subnet.id,
            route_table_id: table.id,
        });
    }

    info!(
        network = %fabric.name,
        id = %network.id,
        subnets = subnets.len(),
        "network fabric ready"
    );
    Ok(ProvisionedFabric {
        network_id: network.id,
        internet_gateway_id: gateway.id,
        fabric: fabric.clone(),
        subnets,
    })
}

/// Create one boundary with its CIDR rules. Identity rules are attached
/// later by [`provision_identity_rules`].
pub async fn provision_boundary(
    scope: &Scope<'_>,
    stack: &str,
    fabric: &ProvisionedFabric,
    spec: &BoundarySpec,
) -> NetworkResult<IsolationBoundary> {
    let no_peers = BTreeMap::new();
    let rules = spec
        .cidr_rules()
        .map(|rule| resolve_rule(spec.role, rule, &no_peers))
        .collect::<Result<Vec<_>, _>>()?;
    let denies_all_egress = spec.denies_all_egress();

    let handle = scope
        .create(
            ResourceKind::Boundary,
            &format!("{stack}-{}", spec.role),
            json!({
                "network_id": fabric.network_id,
                "role": spec.role,
                "description": spec.description,
                "rules": rules,
                "deny_all_egress": denies_all_egress,
            }),
        )
        .await?;

    info!(boundary = %spec.role, id = %handle.id, rules = rules.len(), "boundary ready");
    Ok(IsolationBoundary {
        role: spec.role,
        id: handle.id,
        network_id: fabric.network_id.clone(),
        rules,
        denies_all_egress,
    })
}

/// Attach every identity-referencing rule once all boundaries exist.
pub async fn provision_identity_rules(
    scope: &Scope<'_>,
    policy: &IsolationPolicy,
    boundaries: &BTreeMap<BoundaryRole, IsolationBoundary>,
) -> NetworkResult<Vec<MaterializedRule>> {
    let ids: BTreeMap<_, _> = boundaries
        .iter()
        .map(|(role, b)| (*role, b.id.clone()))
        .collect();

    let mut materialized = Vec::new();
    for (index, (owner, rule)) in policy.identity_rules().into_iter().enumerate() {
        let owner_id = ids
            .get(&owner)
            .cloned()
            .ok_or_else(|| TopologyError::UnresolvedPeer {
                boundary: owner.to_string(),
                peer: owner.to_string(),
            })?;
        let resolved = resolve_rule(owner, rule, &ids)?;
        let handle = scope
            .create(
                ResourceKind::BoundaryRule,
                &format!("{owner}-rule-{index}"),
                json!({ "boundary_id": owner_id, "rule": resolved }),
            )
            .await?;
        materialized.push(MaterializedRule {
            owner,
            owner_id,
            rule_id: handle.id,
            rule: resolved,
        });
    }

    info!(rules = materialized.len(), "identity rules attached");
    Ok(materialized)
}

/// Create the private endpoints. Interface endpoints land in every private
/// subnet behind `guard`; gateway endpoints attach to every private route
/// table.
pub async fn provision_endpoints(
    scope: &Scope<'_>,
    fabric: &ProvisionedFabric,
    guard: &IsolationBoundary,
    specs: &[EndpointSpec],
) -> NetworkResult<Vec<ProvisionedEndpoint>> {
    if guard.role != BoundaryRole::InternalEgress {
        return Err(TopologyError::Policy(format!(
            "private endpoints must sit behind the internal-egress boundary, not {}",
            guard.role
        ))
        .into());
    }

    let private_subnets = fabric.subnet_ids(SubnetRole::Private);
    let private_tables = fabric.route_table_ids(SubnetRole::Private);

    let mut endpoints = Vec::with_capacity(specs.len());
    for spec in specs {
        let (subnet_ids, route_table_ids, boundary_id) = match spec.kind {
            EndpointKind::Interface => (private_subnets.clone(), Vec::new(), Some(guard.id.clone())),
            EndpointKind::Gateway => (Vec::new(), private_tables.clone(), None),
        };
        let handle = scope
            .create(
                ResourceKind::PrivateEndpoint,
                &spec.name,
                json!({
                    "network_id": fabric.network_id,
                    "service": spec.service,
                    "kind": spec.kind,
                    "private_dns": spec.private_dns,
                    "subnet_ids": subnet_ids,
                    "route_table_ids": route_table_ids,
                    "boundary_id": boundary_id,
                    "prefix_list": (spec.kind == EndpointKind::Gateway).then(|| spec.prefix_list()),
                }),
            )
            .await?;
        debug!(endpoint = %spec.name, service = %spec.service, "private endpoint ready");
        endpoints.push(ProvisionedEndpoint {
            spec: spec.clone(),
            id: handle.id,
            subnet_ids,
            route_table_ids,
            boundary_id,
        });
    }
    Ok(endpoints)
}

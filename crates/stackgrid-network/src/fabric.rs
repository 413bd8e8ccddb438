//! Network fabric planning and verification.
//!
//! `build_fabric` carves the fabric CIDR into equally sized subnets, one
//! per (subnet entry, zone) pair, in declaration order. Public subnets get
//! a default route to the internet gateway; private subnets get only the
//! local route plus any gateway-endpoint prefix-list routes. There is no
//! NAT strategy other than `None`.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use stackgrid_core::config::{NetworkSettings, SubnetEntry};
use stackgrid_core::{ResourceId, SubnetRole};

use crate::cidr::Ipv4Cidr;
use crate::error::TopologyError;

pub const MIN_ZONES: u8 = 2;
pub const MAX_ZONES: u8 = 6;
/// Smallest subnet the provider accepts.
pub const MAX_SUBNET_PREFIX: u8 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatStrategy {
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricSpec {
    pub name: String,
    pub region: String,
    pub cidr: Ipv4Cidr,
    pub zone_count: u8,
    pub subnets: Vec<SubnetEntry>,
    /// Fixed subnet size; derived from the subnet count when absent.
    pub subnet_prefix: Option<u8>,
    /// Services reached through gateway endpoints from private subnets.
    pub gateway_services: Vec<String>,
    pub enable_dns: bool,
}

impl FabricSpec {
    pub fn from_settings(
        name: &str,
        region: &str,
        settings: &NetworkSettings,
        gateway_services: Vec<String>,
    ) -> Result<Self, TopologyError> {
        Ok(Self {
            name: name.to_string(),
            region: region.to_string(),
            cidr: settings.cidr.parse()?,
            zone_count: settings.zones,
            subnets: settings.subnets.clone(),
            subnet_prefix: settings.subnet_prefix,
            gateway_services,
            enable_dns: true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RouteDestination {
    Cidr(Ipv4Cidr),
    PrefixList(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    Local,
    InternetGateway,
    GatewayEndpoint { service: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: RouteDestination,
    pub target: RouteTarget,
}

impl Route {
    pub fn is_default(&self) -> bool {
        matches!(&self.destination, RouteDestination::Cidr(c) if c.is_default_route())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPlan {
    /// `<entry>-<zone>`, unique within the fabric.
    pub name: String,
    pub zone: String,
    pub role: SubnetRole,
    pub cidr: Ipv4Cidr,
    /// Routes of this subnet's dedicated route table.
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFabric {
    pub name: String,
    pub cidr: Ipv4Cidr,
    pub zones: Vec<String>,
    pub subnets: Vec<SubnetPlan>,
    pub nat: NatStrategy,
    pub enable_dns: bool,
}

/// Zone names follow the `<region>a`, `<region>b`, ... convention.
pub fn zone_names(region: &str, count: u8) -> Vec<String> {
    (0..count)
        .map(|i| format!("{region}{}", char::from(b'a' + i)))
        .collect()
}

fn bits_for(count: u32) -> u8 {
    let mut bits = 0u8;
    while (1u64 << bits) < u64::from(count) {
        bits += 1;
    }
    bits
}

/// Plan a fabric from a spec. The result always passes [`NetworkFabric::verify`].
pub fn build_fabric(spec: &FabricSpec) -> Result<NetworkFabric, TopologyError> {
    if !(MIN_ZONES..=MAX_ZONES).contains(&spec.zone_count) {
        return Err(TopologyError::ZoneCount {
            requested: spec.zone_count,
            min: MIN_ZONES,
            max: MAX_ZONES,
        });
    }
    for role in [SubnetRole::Public, SubnetRole::Private] {
        if !spec.subnets.iter().any(|s| s.role == role) {
            return Err(TopologyError::MissingRole(role));
        }
    }
    let mut seen = HashSet::new();
    for entry in &spec.subnets {
        if !seen.insert(entry.name.as_str()) {
            return Err(TopologyError::DuplicateSubnetName(entry.name.clone()));
        }
    }

    let total = spec.subnets.len() as u32 * u32::from(spec.zone_count);
    let base = spec.cidr.prefix();
    let prefix = match spec.subnet_prefix {
        Some(p) => p,
        None => base.saturating_add(bits_for(total)),
    };
    if prefix < base {
        return Err(TopologyError::SubnetPrefix { prefix, base });
    }
    if prefix > MAX_SUBNET_PREFIX || u64::from(total) > (1u64 << u32::from(prefix - base)) {
        return Err(TopologyError::Capacity {
            cidr: spec.cidr.to_string(),
            subnets: total,
            prefix,
        });
    }

    let zones = zone_names(&spec.region, spec.zone_count);
    let local = Route {
        destination: RouteDestination::Cidr(spec.cidr),
        target: RouteTarget::Local,
    };

    let mut subnets = Vec::with_capacity(total as usize);
    let mut index = 0u32;
    for entry in &spec.subnets {
        for zone in &zones {
            let mut routes = vec![local.clone()];
            match entry.role {
                SubnetRole::Public => routes.push(Route {
                    destination: RouteDestination::Cidr(Ipv4Cidr::any()),
                    target: RouteTarget::InternetGateway,
                }),
                SubnetRole::Private => {
                    routes.extend(spec.gateway_services.iter().map(|service| Route {
                        destination: RouteDestination::PrefixList(format!("pl-{service}")),
                        target: RouteTarget::GatewayEndpoint {
                            service: service.clone(),
                        },
                    }))
                }
            }
            subnets.push(SubnetPlan {
                name: format!("{}-{zone}", entry.name),
                zone: zone.clone(),
                role: entry.role,
                cidr: spec.cidr.subdivide(prefix, index)?,
                routes,
            });
            index += 1;
        }
    }

    let fabric = NetworkFabric {
        name: spec.name.clone(),
        cidr: spec.cidr,
        zones,
        subnets,
        nat: NatStrategy::None,
        enable_dns: spec.enable_dns,
    };
    fabric.verify()?;
    Ok(fabric)
}

impl NetworkFabric {
    pub fn subnets_with_role(&self, role: SubnetRole) -> impl Iterator<Item = &SubnetPlan> {
        self.subnets.iter().filter(move |s| s.role == role)
    }

    /// Check the fabric's structural invariants.
    pub fn verify(&self) -> Result<(), TopologyError> {
        for subnet in &self.subnets {
            if !self.cidr.contains(&subnet.cidr) {
                return Err(TopologyError::OutsideFabric {
                    subnet: subnet.name.clone(),
                    cidr: self.cidr.to_string(),
                });
            }
        }
        for (i, a) in self.subnets.iter().enumerate() {
            for b in &self.subnets[i + 1..] {
                if a.cidr.overlaps(&b.cidr) {
                    return Err(TopologyError::Overlap {
                        a: a.name.clone(),
                        b: b.name.clone(),
                    });
                }
            }
        }
        for role in [SubnetRole::Public, SubnetRole::Private] {
            let covered: BTreeSet<&str> = self
                .subnets_with_role(role)
                .map(|s| s.zone.as_str())
                .collect();
            if covered.is_empty() || covered.len() != self.zones.len() {
                return Err(TopologyError::MissingRole(role));
            }
        }
        for subnet in self.subnets_with_role(SubnetRole::Private) {
            if subnet
                .routes
                .iter()
                .any(|r| r.is_default() || r.target == RouteTarget::InternetGateway)
            {
                return Err(TopologyError::PublicRouteOnPrivate {
                    subnet: subnet.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A materialized subnet and its route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedSubnet {
    pub plan: SubnetPlan,
    pub id: ResourceId,
    pub route_table_id: ResourceId,
}

/// The fabric after provisioning. This is the output of the `Network` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFabric {
    pub network_id: ResourceId,
    pub internet_gateway_id: ResourceId,
    pub fabric: NetworkFabric,
    pub subnets: Vec<ProvisionedSubnet>,
}

impl ProvisionedFabric {
    pub fn subnet_ids(&self, role: SubnetRole) -> Vec<ResourceId> {
        self.subnets
            .iter()
            .filter(|s| s.plan.role == role)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn route_table_ids(&self, role: SubnetRole) -> Vec<ResourceId> {
        self.subnets
            .iter()
            .filter(|s| s.plan.role == role)
            .map(|s| s.route_table_id.clone())
            .collect()
    }
}

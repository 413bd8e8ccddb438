//! Traffic isolation boundaries.
//!
//! A policy is a small directed graph: boundaries are nodes and every rule
//! whose peer is another boundary is an edge. Boundary identities only
//! exist after creation, so materialization happens in two steps:
//!
//! 1. each boundary is created with its CIDR rules only;
//! 2. identity rules are resolved against the created boundaries and
//!    attached afterwards.
//!
//! Step 2 is also what breaks the workload ↔ internal-egress cycle.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use stackgrid_core::ResourceId;

use crate::cidr::Ipv4Cidr;
use crate::error::TopologyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryRole {
    /// Guards the edge router. Public CIDR peers only.
    Edge,
    /// Guards the interface endpoints.
    InternalEgress,
    /// Guards workload replicas. Reachable from the edge only.
    Workload,
}

impl BoundaryRole {
    pub const ALL: [BoundaryRole; 3] = [
        BoundaryRole::Edge,
        BoundaryRole::InternalEgress,
        BoundaryRole::Workload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryRole::Edge => "edge",
            BoundaryRole::InternalEgress => "internal-egress",
            BoundaryRole::Workload => "workload",
        }
    }
}

impl fmt::Display for BoundaryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    All,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }

    pub fn all() -> Self {
        Self {
            from: 0,
            to: u16::MAX,
        }
    }

    pub fn is_all(&self) -> bool {
        *self == Self::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Peer {
    Cidr(Ipv4Cidr),
    Boundary(BoundaryRole),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub direction: Direction,
    pub protocol: Protocol,
    pub ports: PortRange,
    pub peer: Peer,
}

impl RuleSpec {
    pub fn inbound(protocol: Protocol, ports: PortRange, peer: Peer) -> Self {
        Self {
            direction: Direction::Inbound,
            protocol,
            ports,
            peer,
        }
    }

    pub fn outbound(protocol: Protocol, ports: PortRange, peer: Peer) -> Self {
        Self {
            direction: Direction::Outbound,
            protocol,
            ports,
            peer,
        }
    }

    /// Explicit allow-all egress.
    pub fn allow_all_egress() -> Self {
        Self::outbound(Protocol::All, PortRange::all(), Peer::Cidr(Ipv4Cidr::any()))
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.peer, Peer::Boundary(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundarySpec {
    pub role: BoundaryRole,
    pub description: String,
    /// Ordered; materialized in this order.
    pub rules: Vec<RuleSpec>,
}

impl BoundarySpec {
    pub fn rules_in(&self, direction: Direction) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(move |r| r.direction == direction)
    }

    /// No outbound rules means no egress at all, never "unrestricted".
    pub fn denies_all_egress(&self) -> bool {
        self.rules_in(Direction::Outbound).next().is_none()
    }

    /// Rules that can be created together with the boundary.
    pub fn cidr_rules(&self) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(|r| !r.is_identity())
    }

    /// Rules that wait until their peer boundary exists.
    pub fn identity_rules(&self) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(|r| r.is_identity())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    pub boundaries: Vec<BoundarySpec>,
}

impl IsolationPolicy {
    /// Edge takes the public web ports, workload takes traffic only from
    /// the edge, internal-egress takes traffic only from the workload.
    pub fn standard(container_port: u16) -> Self {
        let anywhere = Peer::Cidr(Ipv4Cidr::any());
        Self {
            boundaries: vec![
                BoundarySpec {
                    role: BoundaryRole::Edge,
                    description: "public HTTP and HTTPS into the edge router".to_string(),
                    rules: vec![
                        RuleSpec::inbound(Protocol::Tcp, PortRange::single(443), anywhere),
                        RuleSpec::inbound(Protocol::Tcp, PortRange::single(80), anywhere),
                        RuleSpec::allow_all_egress(),
                    ],
                },
                BoundarySpec {
                    role: BoundaryRole::InternalEgress,
                    description: "private endpoints reachable from workloads".to_string(),
                    rules: vec![
                        RuleSpec::inbound(
                            Protocol::All,
                            PortRange::all(),
                            Peer::Boundary(BoundaryRole::Workload),
                        ),
                        RuleSpec::allow_all_egress(),
                    ],
                },
                BoundarySpec {
                    role: BoundaryRole::Workload,
                    description: "workload replicas behind the edge router".to_string(),
                    rules: vec![
                        RuleSpec::inbound(
                            Protocol::Tcp,
                            PortRange::single(container_port),
                            Peer::Boundary(BoundaryRole::Edge),
                        ),
                        RuleSpec::allow_all_egress(),
                        RuleSpec::outbound(
                            Protocol::All,
                            PortRange::all(),
                            Peer::Boundary(BoundaryRole::InternalEgress),
                        ),
                    ],
                },
            ],
        }
    }

    pub fn boundary(&self, role: BoundaryRole) -> Option<&BoundarySpec> {
        self.boundaries.iter().find(|b| b.role == role)
    }

    /// Check policy invariants. Runs at plan time.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut roles = HashSet::new();
        for boundary in &self.boundaries {
            if !roles.insert(boundary.role) {
                return Err(TopologyError::Policy(format!(
                    "boundary {} declared twice",
                    boundary.role
                )));
            }
        }

        for boundary in &self.boundaries {
            for rule in &boundary.rules {
                if rule.ports.from > rule.ports.to {
                    return Err(TopologyError::Policy(format!(
                        "{}: port range {}-{} is inverted",
                        boundary.role, rule.ports.from, rule.ports.to
                    )));
                }
                if rule.protocol == Protocol::All && !rule.ports.is_all() {
                    return Err(TopologyError::Policy(format!(
                        "{}: protocol all must cover all ports",
                        boundary.role
                    )));
                }
                if let Peer::Boundary(peer) = rule.peer {
                    if !roles.contains(&peer) {
                        return Err(TopologyError::UnresolvedPeer {
                            boundary: boundary.role.to_string(),
                            peer: peer.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(edge) = self.boundary(BoundaryRole::Edge) {
            if edge.rules.iter().any(RuleSpec::is_identity) {
                return Err(TopologyError::Policy(
                    "edge boundary may only reference CIDR peers".to_string(),
                ));
            }
        }

        if let Some(workload) = self.boundary(BoundaryRole::Workload) {
            let mut inbound = workload.rules_in(Direction::Inbound).peekable();
            if inbound.peek().is_none() {
                return Err(TopologyError::Policy(
                    "workload boundary has no inbound rule from the edge".to_string(),
                ));
            }
            if inbound.any(|r| r.peer != Peer::Boundary(BoundaryRole::Edge)) {
                return Err(TopologyError::Policy(
                    "workload boundary accepts inbound traffic only from the edge".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Identity rules of every boundary, tagged with their owner.
    pub fn identity_rules(&self) -> Vec<(BoundaryRole, &RuleSpec)> {
        self.boundaries
            .iter()
            .flat_map(|b| b.identity_rules().map(move |r| (b.role, r)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedPeer {
    Cidr { cidr: Ipv4Cidr },
    Boundary { role: BoundaryRole, id: ResourceId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub ports: PortRange,
    pub peer: ResolvedPeer,
}

/// Resolve a rule's peer to a runtime identity.
pub fn resolve_rule(
    owner: BoundaryRole,
    rule: &RuleSpec,
    ids: &BTreeMap<BoundaryRole, ResourceId>,
) -> Result<ResolvedRule, TopologyError> {
    let peer = match rule.peer {
        Peer::Cidr(cidr) => ResolvedPeer::Cidr { cidr },
        Peer::Boundary(role) => ResolvedPeer::Boundary {
            role,
            id: ids
                .get(&role)
                .cloned()
                .ok_or_else(|| TopologyError::UnresolvedPeer {
                    boundary: owner.to_string(),
                    peer: role.to_string(),
                })?,
        },
    };
    Ok(ResolvedRule {
        direction: rule.direction,
        protocol: rule.protocol,
        ports: rule.ports,
        peer,
    })
}

/// A created boundary with its CIDR rules. Output of a `Boundary` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationBoundary {
    pub role: BoundaryRole,
    pub id: ResourceId,
    pub network_id: ResourceId,
    pub rules: Vec<ResolvedRule>,
    pub denies_all_egress: bool,
}

/// An identity rule attached after every boundary exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedRule {
    pub owner: BoundaryRole,
    pub owner_id: ResourceId,
    pub rule_id: ResourceId,
    pub rule: ResolvedRule,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_policy_validates() {
        let policy = IsolationPolicy::standard(3000);
        policy.validate().unwrap();
        assert_eq!(policy.boundaries.len(), 3);
        assert_eq!(policy.identity_rules().len(), 3);
    }

    #[test]
    fn edge_has_no_identity_peers() {
        let policy = IsolationPolicy::standard(3000);
        let edge = policy.boundary(BoundaryRole::Edge).unwrap();
        assert_eq!(edge.identity_rules().count(), 0);
        assert_eq!(edge.cidr_rules().count(), 3);
    }

    #[test]
    fn workload_inbound_only_from_edge() {
        let policy = IsolationPolicy::standard(8080);
        let workload = policy.boundary(BoundaryRole::Workload).unwrap();
        let inbound: Vec<_> = workload.rules_in(Direction::Inbound).collect();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].peer, Peer::Boundary(BoundaryRole::Edge));
        assert_eq!(inbound[0].ports, PortRange::single(8080));
    }

    #[test]
    fn empty_outbound_denies_all() {
        let spec = BoundarySpec {
            role: BoundaryRole::InternalEgress,
            description: String::new(),
            rules: vec![RuleSpec::inbound(
                Protocol::Tcp,
                PortRange::single(443),
                Peer::Cidr(Ipv4Cidr::any()),
            )],
        };
        assert!(spec.denies_all_egress());

        let policy = IsolationPolicy::standard(3000);
        assert!(!policy.boundary(BoundaryRole::Edge).unwrap().denies_all_egress());
    }

    #[test]
    fn rejects_workload_inbound_from_cidr() {
        let mut policy = IsolationPolicy::standard(3000);
        let workload = policy
            .boundaries
            .iter_mut()
            .find(|b| b.role == BoundaryRole::Workload)
            .unwrap();
        workload.rules.push(RuleSpec::inbound(
            Protocol::Tcp,
            PortRange::single(22),
            Peer::Cidr(Ipv4Cidr::any()),
        ));
        assert!(matches!(policy.validate(), Err(TopologyError::Policy(_))));
    }

    #[test]
    fn rejects_edge_identity_peer() {
        let mut policy = IsolationPolicy::standard(3000);
        policy.boundaries[0].rules.push(RuleSpec::outbound(
            Protocol::Tcp,
            PortRange::single(3000),
            Peer::Boundary(BoundaryRole::Workload),
        ));
        assert!(matches!(policy.validate(), Err(TopologyError::Policy(_))));
    }

    #[test]
    fn rejects_unknown_peer_and_duplicates() {
        let mut policy = IsolationPolicy::standard(3000);
        policy.boundaries.retain(|b| b.role != BoundaryRole::InternalEgress);
        assert!(matches!(
            policy.validate(),
            Err(TopologyError::UnresolvedPeer { .. })
        ));

        let mut policy = IsolationPolicy::standard(3000);
        let dup = policy.boundaries[0].clone();
        policy.boundaries.push(dup);
        assert!(matches!(policy.validate(), Err(TopologyError::Policy(_))));
    }

    #[test]
    fn rejects_protocol_all_with_partial_ports() {
        let mut policy = IsolationPolicy::standard(3000);
        policy.boundaries[0].rules.push(RuleSpec::inbound(
            Protocol::All,
            PortRange::single(80),
            Peer::Cidr(Ipv4Cidr::any()),
        ));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn resolve_needs_peer_identity() {
        let policy = IsolationPolicy::standard(3000);
        let (owner, rule) = policy.identity_rules()[0];

        let empty = BTreeMap::new();
        assert!(matches!(
            resolve_rule(owner, rule, &empty),
            Err(TopologyError::UnresolvedPeer { .. })
        ));

        let ids: BTreeMap<_, _> = BoundaryRole::ALL
            .iter()
            .map(|r| (*r, ResourceId::new(format!("bnd-{r}"))))
            .collect();
        let resolved = resolve_rule(owner, rule, &ids).unwrap();
        assert!(matches!(resolved.peer, ResolvedPeer::Boundary { .. }));
    }
}

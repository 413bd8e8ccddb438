//! Typed dependency graph of the fixed topology.
//!
//! Every cross-resource reference is an edge between [`NodeId`]s. The
//! walk never matches resources by name or id string; a consumer sees a
//! producer's output only through the edge.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use stackgrid_core::ResourceKind;
use stackgrid_network::BoundaryRole;

use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "node", content = "role", rename_all = "snake_case")]
pub enum NodeId {
    Network,
    Boundary(BoundaryRole),
    BoundaryRules,
    PrivateEndpoints,
    Image,
    LogSink,
    ExecutionRole,
    Cluster,
    Certificate,
    ValidationRecord,
    CertificateValidation,
    EdgeRouter,
    TargetPool,
    AliasRecord,
    HttpsListener,
    HttpRedirectListener,
    WorkloadDefinition,
    ManagedService,
}

impl NodeId {
    pub const ALL: [NodeId; 20] = [
        NodeId::Network,
        NodeId::Boundary(BoundaryRole::Edge),
        NodeId::Boundary(BoundaryRole::InternalEgress),
        NodeId::Boundary(BoundaryRole::Workload),
        NodeId::BoundaryRules,
        NodeId::PrivateEndpoints,
        NodeId::Image,
        NodeId::LogSink,
        NodeId::ExecutionRole,
        NodeId::Cluster,
        NodeId::Certificate,
        NodeId::ValidationRecord,
        NodeId::CertificateValidation,
        NodeId::EdgeRouter,
        NodeId::TargetPool,
        NodeId::AliasRecord,
        NodeId::HttpsListener,
        NodeId::HttpRedirectListener,
        NodeId::WorkloadDefinition,
        NodeId::ManagedService,
    ];

    /// Producers this node waits for.
    pub fn depends_on(&self) -> Vec<NodeId> {
        use NodeId::*;
        match self {
            Network | Image | LogSink | ExecutionRole | Cluster | Certificate => vec![],
            Boundary(_) => vec![Network],
            BoundaryRules => BoundaryRole::ALL.iter().map(|r| Boundary(*r)).collect(),
            PrivateEndpoints => vec![Network, Boundary(BoundaryRole::InternalEgress)],
            ValidationRecord => vec![Certificate],
            CertificateValidation => vec![Certificate, ValidationRecord],
            EdgeRouter => vec![Network, Boundary(BoundaryRole::Edge)],
            TargetPool => vec![Network, EdgeRouter],
            AliasRecord => vec![EdgeRouter],
            HttpsListener => vec![EdgeRouter, TargetPool, CertificateValidation],
            HttpRedirectListener => vec![EdgeRouter, HttpsListener],
            WorkloadDefinition => vec![Image, LogSink, ExecutionRole],
            ManagedService => vec![
                Cluster,
                WorkloadDefinition,
                Network,
                Boundary(BoundaryRole::Workload),
                BoundaryRules,
                PrivateEndpoints,
                TargetPool,
                HttpsListener,
            ],
        }
    }

    /// Logical name, unique within a stack.
    pub fn name(&self) -> String {
        match self {
            NodeId::Network => "network".to_string(),
            NodeId::Boundary(role) => format!("boundary-{role}"),
            NodeId::BoundaryRules => "boundary-rules".to_string(),
            NodeId::PrivateEndpoints => "private-endpoints".to_string(),
            NodeId::Image => "image".to_string(),
            NodeId::LogSink => "log-sink".to_string(),
            NodeId::ExecutionRole => "execution-role".to_string(),
            NodeId::Cluster => "cluster".to_string(),
            NodeId::Certificate => "certificate".to_string(),
            NodeId::ValidationRecord => "validation-record".to_string(),
            NodeId::CertificateValidation => "certificate-validation".to_string(),
            NodeId::EdgeRouter => "edge-router".to_string(),
            NodeId::TargetPool => "target-pool".to_string(),
            NodeId::AliasRecord => "alias-record".to_string(),
            NodeId::HttpsListener => "https-listener".to_string(),
            NodeId::HttpRedirectListener => "http-redirect-listener".to_string(),
            NodeId::WorkloadDefinition => "workload-definition".to_string(),
            NodeId::ManagedService => "managed-service".to_string(),
        }
    }

    /// Kind the node's entity record is filed under.
    pub fn kind(&self) -> ResourceKind {
        match self {
            NodeId::Network => ResourceKind::Network,
            NodeId::Boundary(_) => ResourceKind::Boundary,
            NodeId::BoundaryRules => ResourceKind::BoundaryRule,
            NodeId::PrivateEndpoints => ResourceKind::PrivateEndpoint,
            NodeId::Image => ResourceKind::Image,
            NodeId::LogSink => ResourceKind::LogSink,
            NodeId::ExecutionRole => ResourceKind::ExecutionRole,
            NodeId::Cluster => ResourceKind::Cluster,
            NodeId::Certificate | NodeId::CertificateValidation => ResourceKind::Certificate,
            NodeId::ValidationRecord | NodeId::AliasRecord => ResourceKind::DnsRecord,
            NodeId::EdgeRouter => ResourceKind::LoadBalancer,
            NodeId::TargetPool => ResourceKind::TargetPool,
            NodeId::HttpsListener | NodeId::HttpRedirectListener => ResourceKind::Listener,
            NodeId::WorkloadDefinition => ResourceKind::WorkloadDefinition,
            NodeId::ManagedService => ResourceKind::ManagedService,
        }
    }

    /// Store key of the node's entity record.
    pub fn key(&self) -> String {
        stackgrid_state::entity_key(self.kind(), &self.name())
    }

    /// Reverse of [`NodeId::key`].
    pub fn from_key(key: &str) -> Option<NodeId> {
        NodeId::ALL.into_iter().find(|n| n.key() == key)
    }

    /// Kinds that change in place instead of being replaced.
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            NodeId::HttpsListener
                | NodeId::HttpRedirectListener
                | NodeId::ManagedService
                | NodeId::AliasRecord
                | NodeId::ValidationRecord
        )
    }

    /// A failed record of this node is never retried automatically.
    pub fn is_terminal_on_failure(&self) -> bool {
        matches!(self, NodeId::CertificateValidation)
    }

    /// Nodes that get a new generation on certificate re-issuance.
    pub fn is_certificate_chain(&self) -> bool {
        matches!(
            self,
            NodeId::Certificate | NodeId::ValidationRecord | NodeId::CertificateValidation
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Validated adjacency of the node graph.
#[derive(Debug, Clone)]
pub struct TopologyGraph {
    deps: BTreeMap<NodeId, Vec<NodeId>>,
    dependents: BTreeMap<NodeId, Vec<NodeId>>,
    order: Vec<NodeId>,
}

impl TopologyGraph {
    /// The fixed topology.
    pub fn standard() -> ProvisionResult<Self> {
        Self::from_edges(NodeId::ALL.iter().map(|n| (*n, n.depends_on())))
    }

    /// Build and validate a graph. Unknown dependencies and cycles are
    /// rejected.
    pub fn from_edges(
        edges: impl IntoIterator<Item = (NodeId, Vec<NodeId>)>,
    ) -> ProvisionResult<Self> {
        let deps: BTreeMap<NodeId, Vec<NodeId>> = edges.into_iter().collect();
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> =
            deps.keys().map(|n| (*n, Vec::new())).collect();

        for (node, producers) in &deps {
            for producer in producers {
                match dependents.get_mut(producer) {
                    Some(list) => list.push(*node),
                    None => {
                        return Err(ProvisionError::InvalidTopology(format!(
                            "{node} depends on unknown node {producer}"
                        )));
                    }
                }
            }
        }

        // Kahn's algorithm; leftovers sit on a cycle.
        let mut indegree: BTreeMap<NodeId, usize> =
            deps.iter().map(|(n, p)| (*n, p.len())).collect();
        let mut queue: VecDeque<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(deps.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for dependent in &dependents[&node] {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }
        if order.len() != deps.len() {
            let stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(ProvisionError::InvalidTopology(format!(
                "dependency cycle through {}",
                stuck.join(", ")
            )));
        }

        Ok(Self {
            deps,
            dependents,
            order,
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.deps.keys().copied()
    }

    pub fn deps(&self, node: NodeId) -> &[NodeId] {
        self.deps.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, node: NodeId) -> &[NodeId] {
        self.dependents.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A topological order: producers before consumers.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Position of each node in [`TopologyGraph::order`].
    pub fn rank(&self) -> BTreeMap<NodeId, usize> {
        self.order.iter().enumerate().map(|(i, n)| (*n, i)).collect()
    }

    /// Nodes grouped by longest distance from a root. Nodes in the same
    /// wave never depend on each other.
    pub fn waves(&self) -> Vec<Vec<NodeId>> {
        let mut depth: BTreeMap<NodeId, usize> = BTreeMap::new();
        for node in &self.order {
            let d = self
                .deps(*node)
                .iter()
                .map(|p| depth.get(p).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*node, d);
        }
        let mut waves: Vec<Vec<NodeId>> = Vec::new();
        for (node, d) in depth {
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(node);
        }
        waves
    }

    /// Every node reachable from `node` along dependent edges.
    pub fn downstream(&self, node: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(*dependent) {
                    stack.push(*dependent);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_graph_is_acyclic() {
        let graph = TopologyGraph::standard().unwrap();
        assert_eq!(graph.order().len(), NodeId::ALL.len());

        let rank = graph.rank();
        for node in graph.nodes() {
            for producer in graph.deps(node) {
                assert!(rank[producer] < rank[&node], "{producer} must precede {node}");
            }
        }
    }

    #[test]
    fn https_precedes_http_redirect() {
        let rank = TopologyGraph::standard().unwrap().rank();
        assert!(rank[&NodeId::HttpsListener] < rank[&NodeId::HttpRedirectListener]);
        assert!(rank[&NodeId::CertificateValidation] < rank[&NodeId::HttpsListener]);
        assert!(rank[&NodeId::EdgeRouter] < rank[&NodeId::TargetPool]);
    }

    #[test]
    fn independent_roots_share_the_first_wave() {
        let waves = TopologyGraph::standard().unwrap().waves();
        assert!(waves[0].contains(&NodeId::Network));
        assert!(waves[0].contains(&NodeId::Certificate));
        assert!(waves[0].contains(&NodeId::Image));
        let last = waves.last().unwrap();
        assert!(last.contains(&NodeId::ManagedService));
        assert!(last.contains(&NodeId::HttpRedirectListener));
        assert_eq!(last.len(), 2);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = TopologyGraph::from_edges([
            (NodeId::Network, vec![NodeId::Cluster]),
            (NodeId::Cluster, vec![NodeId::Network]),
        ])
        .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTopology(msg) if msg.contains("cycle")));
    }

    #[test]
    fn unknown_dependencies_are_rejected() {
        let err = TopologyGraph::from_edges([(NodeId::TargetPool, vec![NodeId::EdgeRouter])])
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTopology(msg) if msg.contains("unknown")));
    }

    #[test]
    fn keys_round_trip() {
        for node in NodeId::ALL {
            assert_eq!(NodeId::from_key(&node.key()), Some(node));
        }
        assert_eq!(NodeId::Boundary(BoundaryRole::Edge).key(), "boundary/boundary-edge");
    }

    #[test]
    fn certificate_failure_reaches_listeners_and_service() {
        let graph = TopologyGraph::standard().unwrap();
        let downstream = graph.downstream(NodeId::CertificateValidation);
        assert!(downstream.contains(&NodeId::HttpsListener));
        assert!(downstream.contains(&NodeId::HttpRedirectListener));
        assert!(downstream.contains(&NodeId::ManagedService));
        assert!(!downstream.contains(&NodeId::Network));
    }
}

//! Typed node outputs and the view a node gets of its producers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stackgrid_cert::Certificate;
use stackgrid_cloud::DnsRecord;
use stackgrid_core::{ImageRef, ResourceId};
use stackgrid_edge::{AliasRecord, EdgeRouter, Listener, TargetPool};
use stackgrid_network::{
    BoundaryRole, IsolationBoundary, MaterializedRule, ProvisionedEndpoint, ProvisionedFabric,
};
use stackgrid_rollout::{Cluster, ExecutionRole, LogSink, ManagedService, WorkloadDefinition};

use crate::error::{ProvisionError, ProvisionResult};
use crate::graph::NodeId;

/// What a node hands its dependents once Ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", content = "output", rename_all = "snake_case")]
pub enum NodeOutput {
    Network(ProvisionedFabric),
    Boundary(IsolationBoundary),
    BoundaryRules(Vec<MaterializedRule>),
    PrivateEndpoints(Vec<ProvisionedEndpoint>),
    Image(ImageRef),
    LogSink(LogSink),
    ExecutionRole(ExecutionRole),
    Cluster(Cluster),
    Certificate(Certificate),
    ValidationRecord(DnsRecord),
    CertificateValidation(Certificate),
    EdgeRouter(EdgeRouter),
    TargetPool(TargetPool),
    AliasRecord(AliasRecord),
    HttpsListener(Listener),
    HttpRedirectListener(Listener),
    WorkloadDefinition(WorkloadDefinition),
    ManagedService(ManagedService),
    /// Resources a failed attempt created before giving up. Never handed
    /// to dependents; kept only so the generation can be retired.
    Remnants(Vec<ResourceId>),
}

impl NodeOutput {
    /// Runtime id of the resource that stands for the node, if any.
    pub fn primary_id(&self) -> Option<ResourceId> {
        match self {
            NodeOutput::Network(f) => Some(f.network_id.clone()),
            NodeOutput::Boundary(b) => Some(b.id.clone()),
            NodeOutput::LogSink(s) => Some(s.id.clone()),
            NodeOutput::ExecutionRole(r) => Some(r.id.clone()),
            NodeOutput::Cluster(c) => Some(c.id.clone()),
            NodeOutput::EdgeRouter(r) => Some(r.id.clone()),
            NodeOutput::TargetPool(p) => Some(p.id.clone()),
            NodeOutput::HttpsListener(l) | NodeOutput::HttpRedirectListener(l) => Some(l.id.clone()),
            NodeOutput::WorkloadDefinition(d) => Some(d.id.clone()),
            NodeOutput::ManagedService(s) => Some(s.id.clone()),
            NodeOutput::Remnants(ids) => ids.first().cloned(),
            NodeOutput::BoundaryRules(_)
            | NodeOutput::PrivateEndpoints(_)
            | NodeOutput::Image(_)
            | NodeOutput::Certificate(_)
            | NodeOutput::ValidationRecord(_)
            | NodeOutput::CertificateValidation(_)
            | NodeOutput::AliasRecord(_) => None,
        }
    }

    /// Every cloud resource the node owns, in creation order. Retirement
    /// deletes them back to front.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        match self {
            NodeOutput::Network(f) => {
                let mut ids = vec![f.network_id.clone(), f.internet_gateway_id.clone()];
                for subnet in &f.subnets {
                    ids.push(subnet.route_table_id.clone());
                    ids.push(subnet.id.clone());
                }
                ids
            }
            NodeOutput::BoundaryRules(rules) => rules.iter().map(|r| r.rule_id.clone()).collect(),
            NodeOutput::PrivateEndpoints(eps) => eps.iter().map(|e| e.id.clone()).collect(),
            NodeOutput::Remnants(ids) => ids.clone(),
            other => other.primary_id().into_iter().collect(),
        }
    }
}

/// Outputs of a node's producers, gathered when the node is scheduled.
///
/// Every getter fails with `OrderingViolation` when the producer is
/// missing, so a node can never reach the cloud with a hole in its
/// inputs.
#[derive(Debug, Clone)]
pub struct Inputs {
    node: NodeId,
    outputs: BTreeMap<NodeId, Arc<NodeOutput>>,
}

impl Inputs {
    pub fn new(node: NodeId, outputs: BTreeMap<NodeId, Arc<NodeOutput>>) -> Self {
        Self { node, outputs }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn contains(&self, producer: NodeId) -> bool {
        self.outputs.contains_key(&producer)
    }

    /// Fail unless every listed producer is present.
    pub fn require_all(&self, producers: &[NodeId]) -> ProvisionResult<()> {
        match producers.iter().find(|p| !self.contains(**p)) {
            Some(missing) => Err(self.violation(*missing)),
            None => Ok(()),
        }
    }

    fn violation(&self, missing: NodeId) -> ProvisionError {
        ProvisionError::OrderingViolation {
            node: self.node.to_string(),
            missing: missing.to_string(),
        }
    }

    fn get(&self, producer: NodeId) -> ProvisionResult<&NodeOutput> {
        self.outputs
            .get(&producer)
            .map(Arc::as_ref)
            .ok_or_else(|| self.violation(producer))
    }

    pub fn fabric(&self) -> ProvisionResult<&ProvisionedFabric> {
        match self.get(NodeId::Network)? {
            NodeOutput::Network(f) => Ok(f),
            _ => Err(self.violation(NodeId::Network)),
        }
    }

    pub fn boundary(&self, role: BoundaryRole) -> ProvisionResult<&IsolationBoundary> {
        let producer = NodeId::Boundary(role);
        match self.get(producer)? {
            NodeOutput::Boundary(b) => Ok(b),
            _ => Err(self.violation(producer)),
        }
    }

    /// All three boundaries, keyed by role.
    pub fn boundaries(&self) -> ProvisionResult<BTreeMap<BoundaryRole, IsolationBoundary>> {
        BoundaryRole::ALL
            .iter()
            .map(|role| Ok((*role, self.boundary(*role)?.clone())))
            .collect()
    }

    pub fn image(&self) -> ProvisionResult<&ImageRef> {
        match self.get(NodeId::Image)? {
            NodeOutput::Image(i) => Ok(i),
            _ => Err(self.violation(NodeId::Image)),
        }
    }

    pub fn log_sink(&self) -> ProvisionResult<&LogSink> {
        match self.get(NodeId::LogSink)? {
            NodeOutput::LogSink(s) => Ok(s),
            _ => Err(self.violation(NodeId::LogSink)),
        }
    }

    pub fn execution_role(&self) -> ProvisionResult<&ExecutionRole> {
        match self.get(NodeId::ExecutionRole)? {
            NodeOutput::ExecutionRole(r) => Ok(r),
            _ => Err(self.violation(NodeId::ExecutionRole)),
        }
    }

    pub fn cluster(&self) -> ProvisionResult<&Cluster> {
        match self.get(NodeId::Cluster)? {
            NodeOutput::Cluster(c) => Ok(c),
            _ => Err(self.violation(NodeId::Cluster)),
        }
    }

    /// The requested certificate, before validation.
    pub fn certificate(&self) -> ProvisionResult<&Certificate> {
        match self.get(NodeId::Certificate)? {
            NodeOutput::Certificate(c) => Ok(c),
            _ => Err(self.violation(NodeId::Certificate)),
        }
    }

    pub fn validation_record(&self) -> ProvisionResult<&DnsRecord> {
        match self.get(NodeId::ValidationRecord)? {
            NodeOutput::ValidationRecord(r) => Ok(r),
            _ => Err(self.violation(NodeId::ValidationRecord)),
        }
    }

    /// The certificate as the validation node left it.
    pub fn validated_certificate(&self) -> ProvisionResult<&Certificate> {
        match self.get(NodeId::CertificateValidation)? {
            NodeOutput::CertificateValidation(c) => Ok(c),
            _ => Err(self.violation(NodeId::CertificateValidation)),
        }
    }

    pub fn router(&self) -> ProvisionResult<&EdgeRouter> {
        match self.get(NodeId::EdgeRouter)? {
            NodeOutput::EdgeRouter(r) => Ok(r),
            _ => Err(self.violation(NodeId::EdgeRouter)),
        }
    }

    pub fn target_pool(&self) -> ProvisionResult<&TargetPool> {
        match self.get(NodeId::TargetPool)? {
            NodeOutput::TargetPool(p) => Ok(p),
            _ => Err(self.violation(NodeId::TargetPool)),
        }
    }

    pub fn https_listener(&self) -> ProvisionResult<&Listener> {
        match self.get(NodeId::HttpsListener)? {
            NodeOutput::HttpsListener(l) => Ok(l),
            _ => Err(self.violation(NodeId::HttpsListener)),
        }
    }

    pub fn definition(&self) -> ProvisionResult<&WorkloadDefinition> {
        match self.get(NodeId::WorkloadDefinition)? {
            NodeOutput::WorkloadDefinition(d) => Ok(d),
            _ => Err(self.violation(NodeId::WorkloadDefinition)),
        }
    }
}

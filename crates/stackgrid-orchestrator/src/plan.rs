//! Plan-time validation and the desired spec of every node.
//!
//! Building a [`Plan`] runs every pure check the builders offer: the
//! fabric layout, the isolation policy, the deployment policy and the
//! image source. Anything malformed is rejected here, before a single
//! external call is made.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Value, json};
use stackgrid_core::ImageRef;
use stackgrid_core::config::{ImageSource, ResolvedStack};
use stackgrid_core::image::context_digest;
use stackgrid_edge::TargetPoolSpec;
use stackgrid_network::endpoints::{default_endpoints, gateway_services};
use stackgrid_network::fabric::build_fabric;
use stackgrid_network::{EndpointSpec, FabricSpec, IsolationPolicy, NetworkFabric};
use stackgrid_rollout::{DeploymentPolicy, ManagedServiceSpec, ResourceShape};
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::graph::{NodeId, TopologyGraph};

/// Container name inside the workload definition.
pub const CONTAINER_NAME: &str = "app";

/// Where the workload image comes from, resolved at plan time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ImagePlan {
    /// Build `context` and push it to `repository`. `digest` is the
    /// content digest of the context when the plan was made.
    Build {
        context: PathBuf,
        repository: String,
        digest: String,
    },
    /// Use an existing digest-pinned image.
    Prebuilt { image: ImageRef },
}

/// Names of the resources the stack creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Names {
    pub network: String,
    pub router: String,
    pub target_pool: String,
    pub log_sink: String,
    pub execution_role: String,
    pub cluster: String,
    pub family: String,
    pub service: String,
}

impl Names {
    pub fn for_stack(stack: &str) -> Self {
        Self {
            network: stack.to_string(),
            router: format!("{stack}-lb"),
            target_pool: format!("{stack}-tg"),
            log_sink: format!("{stack}-logs"),
            execution_role: format!("{stack}-execution-role"),
            cluster: format!("{stack}-cluster"),
            family: format!("{stack}-app"),
            service: format!("{stack}-service"),
        }
    }
}

/// A validated stack, ready to walk.
#[derive(Debug, Clone)]
pub struct Plan {
    pub stack: ResolvedStack,
    pub names: Names,
    pub graph: TopologyGraph,
    pub fabric: NetworkFabric,
    pub policy: IsolationPolicy,
    pub endpoints: Vec<EndpointSpec>,
    pub target_pool: TargetPoolSpec,
    pub deployment: DeploymentPolicy,
    pub image: ImagePlan,
}

impl Plan {
    /// Validate `stack` and derive every node's desired state.
    pub fn build(stack: &ResolvedStack) -> ProvisionResult<Self> {
        let graph = TopologyGraph::standard()?;

        // Network fabric with the gateway endpoints' prefix-list routes.
        let endpoints = default_endpoints(&stack.region);
        let fabric_spec = FabricSpec::from_settings(
            &stack.name,
            &stack.region,
            &stack.network,
            gateway_services(&endpoints),
        )?;
        let fabric = build_fabric(&fabric_spec)?;

        // Isolation boundaries.
        let policy = IsolationPolicy::standard(stack.service.container_port);
        policy.validate()?;

        // Rolling update bounds.
        let deployment = DeploymentPolicy::from(&stack.service);
        deployment.validate(stack.service.desired_count)?;

        let image = match &stack.service.image {
            ImageSource::Build {
                context,
                repository,
            } => {
                let digest =
                    context_digest(context).map_err(|e| ProvisionError::Image(e.to_string()))?;
                debug!(context = %context.display(), %digest, "build context digested");
                ImagePlan::Build {
                    context: context.clone(),
                    repository: repository.clone(),
                    digest,
                }
            }
            ImageSource::Prebuilt(image) => {
                if !image.is_immutable() {
                    return Err(ProvisionError::Image(format!(
                        "image {image} is not pinned by digest"
                    )));
                }
                ImagePlan::Prebuilt {
                    image: image.clone(),
                }
            }
        };

        let names = Names::for_stack(&stack.name);
        let target_pool = TargetPoolSpec::from_settings(
            &names.target_pool,
            stack.service.container_port,
            &stack.target_pool,
        );

        info!(
            stack = %stack.name,
            region = %stack.region,
            subnets = fabric.subnets.len(),
            nodes = graph.order().len(),
            "plan validated"
        );
        Ok(Self {
            stack: stack.clone(),
            names,
            graph,
            fabric,
            policy,
            endpoints,
            target_pool,
            deployment,
            image,
        })
    }

    pub fn service_spec(&self) -> ManagedServiceSpec {
        ManagedServiceSpec {
            name: self.names.service.clone(),
            desired_count: self.stack.service.desired_count,
            container_name: CONTAINER_NAME.to_string(),
            container_port: self.stack.service.container_port,
            policy: self.deployment.clone(),
        }
    }

    pub fn shape(&self) -> ResourceShape {
        ResourceShape {
            cpu: self.stack.service.cpu,
            memory: self.stack.service.memory,
        }
    }

    /// The part of the plan a node is built from. Together with the
    /// producers' identities it makes up the node's fingerprint.
    pub fn desired_spec(&self, node: NodeId) -> Value {
        let stack = &self.stack;
        match node {
            NodeId::Network => json!(self.fabric),
            NodeId::Boundary(role) => json!(self.policy.boundary(role)),
            NodeId::BoundaryRules => json!(self.policy.identity_rules()),
            NodeId::PrivateEndpoints => json!(self.endpoints),
            NodeId::Image => json!(self.image),
            NodeId::LogSink => json!({ "name": self.names.log_sink }),
            NodeId::ExecutionRole => json!({ "name": self.names.execution_role }),
            NodeId::Cluster => json!({ "name": self.names.cluster }),
            NodeId::Certificate => json!({ "domain": stack.domain }),
            NodeId::ValidationRecord => json!({
                "zone_id": stack.hosted_zone_id,
                "ttl": stack.certificate.record_ttl,
            }),
            NodeId::CertificateValidation => json!({
                "domain": stack.domain,
                "zone_id": stack.hosted_zone_id,
            }),
            NodeId::EdgeRouter => json!({ "name": self.names.router }),
            NodeId::TargetPool => json!(self.target_pool),
            NodeId::AliasRecord => json!({
                "zone_id": stack.hosted_zone_id,
                "domain": stack.domain,
            }),
            NodeId::HttpsListener => json!({ "port": 443 }),
            NodeId::HttpRedirectListener => json!({ "port": 80, "redirect_to": 443 }),
            NodeId::WorkloadDefinition => json!({
                "family": self.names.family,
                "container_name": CONTAINER_NAME,
                "shape": self.shape(),
                "container_port": stack.service.container_port,
                "log_stream_prefix": stack.service.log_stream_prefix,
            }),
            NodeId::ManagedService => json!(self.service_spec()),
        }
    }
}

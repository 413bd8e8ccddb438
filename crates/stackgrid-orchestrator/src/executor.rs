//! Per-node create, update, confirm and retire.
//!
//! The executor knows how each [`NodeId`] maps onto the builder crates. It
//! never decides *whether* to act; the engine does that from the stored
//! record and the fingerprint.

use std::sync::Arc;

use stackgrid_cert::{CertificateState, CertificateWorkflow};
use stackgrid_cloud::{AuthorityStatus, CloudError, DnsRecord, Provisioner, RetryPolicy, Scope};
use stackgrid_edge::{
    EdgeError, bind_http_redirect, bind_https, create_router, create_target_pool, publish_alias,
    rebind_https,
};
use stackgrid_network::BoundaryRole;
use stackgrid_network::provision::{
    provision_boundary, provision_endpoints, provision_fabric, provision_identity_rules,
};
use stackgrid_rollout::{
    Placement, WorkloadDefinitionSpec, create_cluster, create_execution_role, create_log_sink,
    create_service, register_definition, update_service,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::graph::NodeId;
use crate::outputs::{Inputs, NodeOutput};
use crate::plan::{CONTAINER_NAME, ImagePlan, Plan};
use crate::providers::Providers;

/// A node that did not reach Ready.
#[derive(Debug)]
pub(crate) struct NodeFailure {
    pub error: ProvisionError,
    /// The node's own state at the time of failure, kept with the record.
    pub output: Option<NodeOutput>,
    /// Retrying cannot succeed without operator action.
    pub terminal: bool,
}

impl From<ProvisionError> for NodeFailure {
    fn from(error: ProvisionError) -> Self {
        Self {
            error,
            output: None,
            terminal: false,
        }
    }
}

pub(crate) struct Executor {
    plan: Arc<Plan>,
    providers: Providers,
    provisioner: Provisioner,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(plan: Arc<Plan>, providers: Providers, provisioner: Provisioner) -> Self {
        let retry = provisioner.retry_policy().clone();
        Self {
            plan,
            providers,
            provisioner,
            retry,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    fn scope(&self, node: NodeId, generation: u64) -> Scope<'_> {
        self.provisioner
            .scope(format!("{}/{node}/{generation}", self.plan.stack.name))
    }

    fn workflow(&self) -> CertificateWorkflow {
        CertificateWorkflow::new(
            self.providers.authority.clone(),
            self.providers.dns.clone(),
            self.plan.stack.hosted_zone_id.clone(),
            self.plan.stack.certificate.clone(),
            self.retry.clone(),
        )
    }

    /// Create generation `generation` of `node`.
    pub async fn create(
        &self,
        node: NodeId,
        generation: u64,
        inputs: &Inputs,
        shutdown: watch::Receiver<bool>,
    ) -> Result<NodeOutput, NodeFailure> {
        if node == NodeId::CertificateValidation {
            return self.validate_certificate(inputs, shutdown).await;
        }
        let scope = self.scope(node, generation);
        self.build(&scope, node, inputs).await.map_err(|error| {
            // Whatever the builder managed to create before failing stays
            // with the failed generation until it is retired.
            let remnants = scope.created();
            if !remnants.is_empty() {
                warn!(
                    %node,
                    generation,
                    count = remnants.len(),
                    "failed attempt left resources behind"
                );
            }
            NodeFailure {
                error,
                output: (!remnants.is_empty()).then_some(NodeOutput::Remnants(remnants)),
                terminal: false,
            }
        })
    }

    async fn build(
        &self,
        scope: &Scope<'_>,
        node: NodeId,
        inputs: &Inputs,
    ) -> ProvisionResult<NodeOutput> {
        let plan = &self.plan;
        let names = &plan.names;
        let stack = &plan.stack;

        let output = match node {
            NodeId::Network => NodeOutput::Network(provision_fabric(scope, &plan.fabric).await?),
            NodeId::Boundary(role) => {
                let spec = plan.policy.boundary(role).ok_or_else(|| {
                    ProvisionError::InvalidTopology(format!("policy has no {role} boundary"))
                })?;
                NodeOutput::Boundary(
                    provision_boundary(scope, &stack.name, inputs.fabric()?, spec).await?,
                )
            }
            NodeId::BoundaryRules => {
                let boundaries = inputs.boundaries()?;
                NodeOutput::BoundaryRules(
                    provision_identity_rules(scope, &plan.policy, &boundaries).await?,
                )
            }
            NodeId::PrivateEndpoints => NodeOutput::PrivateEndpoints(
                provision_endpoints(
                    scope,
                    inputs.fabric()?,
                    inputs.boundary(BoundaryRole::InternalEgress)?,
                    &plan.endpoints,
                )
                .await?,
            ),
            NodeId::Image => self.publish_image().await?,
            NodeId::LogSink => NodeOutput::LogSink(create_log_sink(scope, &names.log_sink).await?),
            NodeId::ExecutionRole => NodeOutput::ExecutionRole(
                create_execution_role(scope, &names.execution_role).await?,
            ),
            NodeId::Cluster => NodeOutput::Cluster(create_cluster(scope, &names.cluster).await?),
            NodeId::Certificate => {
                NodeOutput::Certificate(self.workflow().request(&stack.domain).await?)
            }
            NodeId::ValidationRecord => NodeOutput::ValidationRecord(
                self.workflow()
                    .publish_validation(inputs.certificate()?)
                    .await?,
            ),
            NodeId::CertificateValidation => {
                return Err(ProvisionError::InvalidTopology(
                    "certificate validation has no plain build".to_string(),
                ));
            }
            NodeId::EdgeRouter => NodeOutput::EdgeRouter(
                create_router(
                    scope,
                    &names.router,
                    inputs.fabric()?,
                    inputs.boundary(BoundaryRole::Edge)?,
                )
                .await?,
            ),
            NodeId::TargetPool => NodeOutput::TargetPool(
                create_target_pool(scope, &plan.target_pool, inputs.fabric()?, inputs.router()?)
                    .await?,
            ),
            NodeId::AliasRecord => NodeOutput::AliasRecord(
                publish_alias(
                    self.providers.dns.as_ref(),
                    &self.retry,
                    &stack.hosted_zone_id,
                    &stack.domain,
                    inputs.router()?,
                )
                .await?,
            ),
            NodeId::HttpsListener => NodeOutput::HttpsListener(
                bind_https(
                    scope,
                    inputs.router()?,
                    inputs.target_pool()?,
                    inputs.validated_certificate()?,
                )
                .await?,
            ),
            NodeId::HttpRedirectListener => NodeOutput::HttpRedirectListener(
                bind_http_redirect(scope, inputs.router()?, Some(inputs.https_listener()?))
                    .await?,
            ),
            NodeId::WorkloadDefinition => {
                let spec = WorkloadDefinitionSpec {
                    family: names.family.clone(),
                    container_name: CONTAINER_NAME.to_string(),
                    image: inputs.image()?.clone(),
                    shape: plan.shape(),
                    container_port: stack.service.container_port,
                    log_stream_prefix: stack.service.log_stream_prefix.clone(),
                };
                NodeOutput::WorkloadDefinition(
                    register_definition(
                        scope,
                        &spec,
                        inputs.log_sink()?,
                        inputs.execution_role()?,
                    )
                    .await?,
                )
            }
            NodeId::ManagedService => {
                // The service only starts once its network is complete and
                // the edge can reach it over HTTPS.
                inputs.require_all(&[
                    NodeId::BoundaryRules,
                    NodeId::PrivateEndpoints,
                    NodeId::HttpsListener,
                ])?;
                let placement = Placement::private(
                    inputs.fabric()?,
                    inputs.boundary(BoundaryRole::Workload)?,
                )?;
                NodeOutput::ManagedService(
                    create_service(
                        scope,
                        &plan.service_spec(),
                        inputs.cluster()?,
                        inputs.definition()?,
                        placement,
                        inputs.target_pool()?,
                    )
                    .await?,
                )
            }
        };
        Ok(output)
    }

    async fn publish_image(&self) -> ProvisionResult<NodeOutput> {
        match &self.plan.image {
            ImagePlan::Prebuilt { image } => {
                debug!(%image, "using prebuilt image");
                Ok(NodeOutput::Image(image.clone()))
            }
            ImagePlan::Build {
                context,
                repository,
                digest,
            } => {
                let operation = format!("publish image {repository}");
                let image = self
                    .retry
                    .run(&operation, || {
                        self.providers.registry.publish(context, repository)
                    })
                    .await?;
                if !image.is_immutable() {
                    return Err(ProvisionError::Image(format!(
                        "registry returned a mutable reference {image}"
                    )));
                }
                info!(%image, context_digest = %digest, "image published");
                Ok(NodeOutput::Image(image))
            }
        }
    }

    async fn validate_certificate(
        &self,
        inputs: &Inputs,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<NodeOutput, NodeFailure> {
        let workflow = self.workflow();
        let mut cert = inputs.certificate()?.clone();
        let record = inputs.validation_record()?;
        debug!(domain = %cert.domain, record = %record.name, "confirming validation record");

        workflow
            .confirm_published(&mut cert)
            .await
            .map_err(ProvisionError::from)?;
        match workflow.await_validation(&mut cert, &mut shutdown).await {
            Ok(()) => Ok(NodeOutput::CertificateValidation(cert)),
            Err(e) => {
                let terminal = matches!(cert.state(), CertificateState::Failed { .. });
                Err(NodeFailure {
                    error: e.into(),
                    output: terminal.then(|| NodeOutput::CertificateValidation(cert)),
                    terminal,
                })
            }
        }
    }

    /// Whether `prev` can be changed in place against the current
    /// producers. A listener is pinned to its router and a service to its
    /// cluster; moving either means replacement.
    pub fn can_update_in_place(&self, node: NodeId, prev: &NodeOutput, inputs: &Inputs) -> bool {
        match (node, prev) {
            (NodeId::HttpsListener, NodeOutput::HttpsListener(listener))
            | (NodeId::HttpRedirectListener, NodeOutput::HttpRedirectListener(listener)) => inputs
                .router()
                .map(|router| router.id == listener.router_id)
                .unwrap_or(false),
            (NodeId::ManagedService, NodeOutput::ManagedService(service)) => inputs
                .cluster()
                .map(|cluster| cluster.id == service.cluster_id)
                .unwrap_or(false),
            (NodeId::AliasRecord, NodeOutput::AliasRecord(_))
            | (NodeId::ValidationRecord, NodeOutput::ValidationRecord(_)) => true,
            _ => false,
        }
    }

    /// Move `prev` to the current desired state without replacing it.
    pub async fn update(
        &self,
        node: NodeId,
        generation: u64,
        prev: &NodeOutput,
        inputs: &Inputs,
    ) -> ProvisionResult<NodeOutput> {
        let scope = self.scope(node, generation);
        match (node, prev) {
            (NodeId::HttpsListener, NodeOutput::HttpsListener(existing)) => {
                Ok(NodeOutput::HttpsListener(
                    rebind_https(
                        &scope,
                        existing,
                        inputs.router()?,
                        inputs.target_pool()?,
                        inputs.validated_certificate()?,
                    )
                    .await?,
                ))
            }
            (NodeId::HttpRedirectListener, NodeOutput::HttpRedirectListener(existing)) => {
                // The redirect itself never changes; only its precondition
                // is re-checked.
                let https = inputs.https_listener()?;
                if !https.is_https_forward() || https.router_id != existing.router_id {
                    return Err(EdgeError::MissingHttpsListener {
                        router: existing.router_id.to_string(),
                    }
                    .into());
                }
                Ok(prev.clone())
            }
            (NodeId::ManagedService, NodeOutput::ManagedService(existing)) => {
                inputs.require_all(&[
                    NodeId::BoundaryRules,
                    NodeId::PrivateEndpoints,
                    NodeId::HttpsListener,
                ])?;
                let placement = Placement::private(
                    inputs.fabric()?,
                    inputs.boundary(BoundaryRole::Workload)?,
                )?;
                Ok(NodeOutput::ManagedService(
                    update_service(
                        &scope,
                        existing,
                        &self.plan.service_spec(),
                        inputs.cluster()?,
                        inputs.definition()?,
                        placement,
                        inputs.target_pool()?,
                    )
                    .await?,
                ))
            }
            // Records are upserts.
            (NodeId::AliasRecord, _) | (NodeId::ValidationRecord, _) => {
                self.build(&scope, node, inputs).await
            }
            _ => Err(ProvisionError::InvalidTopology(format!(
                "{node} cannot be updated in place"
            ))),
        }
    }

    /// Whether what `output` describes still exists remotely.
    pub async fn confirm(&self, output: &NodeOutput) -> ProvisionResult<bool> {
        let zone = self.plan.stack.hosted_zone_id.as_str();
        match output {
            NodeOutput::Image(_) => Ok(true),
            NodeOutput::Certificate(cert) => match self.poll_certificate(&cert.id).await {
                Ok(_) => Ok(true),
                Err(CloudError::NotFound(_)) => Ok(false),
                Err(e) => Err(e.into()),
            },
            NodeOutput::CertificateValidation(cert) => {
                if !cert.is_validated() {
                    return Ok(false);
                }
                match self.poll_certificate(&cert.id).await {
                    Ok(status) => Ok(status == AuthorityStatus::Issued),
                    Err(CloudError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            NodeOutput::ValidationRecord(record) => self.record_present(zone, record).await,
            NodeOutput::AliasRecord(alias) => self.record_present(&alias.zone_id, &alias.record).await,
            other => {
                for id in other.resource_ids() {
                    match self.provisioner.read(&id).await? {
                        Some(handle) if handle.is_available() => {}
                        _ => {
                            warn!(%id, "stored resource no longer available");
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    async fn poll_certificate(&self, id: &str) -> Result<AuthorityStatus, CloudError> {
        let operation = format!("poll certificate {id}");
        self.retry
            .run(&operation, || self.providers.authority.poll(id))
            .await
    }

    async fn record_present(&self, zone: &str, record: &DnsRecord) -> ProvisionResult<bool> {
        let operation = format!("query {}", record.name);
        let found = self
            .retry
            .run(&operation, || {
                self.providers.dns.query(zone, &record.name, record.record_type)
            })
            .await?;
        Ok(found.is_some_and(|r| r.value == record.value))
    }

    /// Delete every resource a superseded generation owns, newest first.
    pub async fn retire(&self, output: &NodeOutput) -> ProvisionResult<()> {
        for id in output.resource_ids().iter().rev() {
            self.provisioner.delete(id).await?;
        }
        Ok(())
    }
}

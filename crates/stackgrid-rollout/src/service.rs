//! Managed service: keeps the desired replica count running.
//!
//! Replicas run in private subnets behind the workload boundary, without
//! public IPs, and register into the edge router's target pool. Creating
//! or updating a service starts a rolling update on the platform; the
//! builder waits for the deployment to settle and turns a stalled
//! deployment into [`RolloutError::Stalled`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use stackgrid_cloud::{ResourceHandle, Scope};
use stackgrid_core::{ResourceId, ResourceKind, SubnetRole};
use stackgrid_edge::TargetPool;
use stackgrid_network::{BoundaryRole, IsolationBoundary, ProvisionedFabric};
use tracing::{info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::policy::DeploymentPolicy;
use crate::workload::{Cluster, WorkloadDefinition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedServiceSpec {
    pub name: String,
    pub desired_count: u32,
    pub container_name: String,
    pub container_port: u16,
    pub policy: DeploymentPolicy,
}

/// Where replicas run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub subnet_ids: Vec<ResourceId>,
    pub boundary_id: ResourceId,
    pub assign_public_ip: bool,
}

impl Placement {
    /// Private subnets of `fabric`, behind the workload boundary.
    pub fn private(fabric: &ProvisionedFabric, boundary: &IsolationBoundary) -> RolloutResult<Self> {
        if boundary.role != BoundaryRole::Workload {
            return Err(RolloutError::WrongBoundary(boundary.role));
        }
        let placement = Self {
            subnet_ids: fabric.subnet_ids(SubnetRole::Private),
            boundary_id: boundary.id.clone(),
            assign_public_ip: false,
        };
        placement.check(fabric)?;
        Ok(placement)
    }

    /// Every subnet must be one of the fabric's private subnets.
    pub fn check(&self, fabric: &ProvisionedFabric) -> RolloutResult<()> {
        let private = fabric.subnet_ids(SubnetRole::Private);
        match self.subnet_ids.iter().find(|id| !private.contains(id)) {
            Some(id) => Err(RolloutError::PublicPlacement(id.to_string())),
            None if self.assign_public_ip => Err(RolloutError::PublicPlacement(
                "assign_public_ip".to_string(),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Steady,
    Stalled,
    RolledBack,
}

/// The platform's report on the latest deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub state: DeploymentState,
    pub revision: String,
    pub max_running: u32,
    pub min_healthy: u32,
    pub reason: Option<String>,
}

/// A managed service. Output of the `ManagedService` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedService {
    pub id: ResourceId,
    pub name: String,
    pub cluster_id: ResourceId,
    pub definition_id: ResourceId,
    pub revision: String,
    pub placement: Placement,
    pub target_pool_id: ResourceId,
    pub desired_count: u32,
    pub policy: DeploymentPolicy,
    pub deployment: DeploymentStatus,
}

fn service_spec(
    spec: &ManagedServiceSpec,
    cluster: &Cluster,
    definition: &WorkloadDefinition,
    placement: &Placement,
    pool: &TargetPool,
) -> serde_json::Value {
    json!({
        "cluster_id": cluster.id,
        "definition_id": definition.id,
        "revision": definition.revision,
        "desired_count": spec.desired_count,
        "launch_type": "serverless",
        "network": {
            "subnet_ids": placement.subnet_ids,
            "boundary_ids": [placement.boundary_id],
            "assign_public_ip": placement.assign_public_ip,
        },
        "load_balancer": {
            "target_pool_id": pool.id,
            "container_name": spec.container_name,
            "container_port": spec.container_port,
        },
        "health_check": pool.spec.health,
        "deregistration_delay_ms": pool.spec.deregistration_delay.as_millis() as u64,
        "deployment": {
            "max_surge_percent": spec.policy.max_surge_percent,
            "min_healthy_percent": spec.policy.min_healthy_percent,
            "rollback_on_stall": spec.policy.rollback_on_stall,
            "stall_timeout_ms": spec.policy.stall_timeout.as_millis() as u64,
        },
    })
}

fn read_deployment(handle: &ResourceHandle, spec: &ManagedServiceSpec) -> RolloutResult<DeploymentStatus> {
    let raw = handle
        .attributes
        .get("deployment")
        .cloned()
        .ok_or_else(|| RolloutError::MissingAttribute {
            id: handle.id.to_string(),
            attribute: "deployment".to_string(),
        })?;
    let status: DeploymentStatus =
        serde_json::from_value(raw).map_err(|_| RolloutError::MissingAttribute {
            id: handle.id.to_string(),
            attribute: "deployment".to_string(),
        })?;

    match status.state {
        DeploymentState::Steady => Ok(status),
        DeploymentState::Stalled | DeploymentState::RolledBack => {
            let rolled_back = status.state == DeploymentState::RolledBack;
            warn!(
                service = %spec.name,
                revision = %status.revision,
                rolled_back,
                "deployment did not reach steady state"
            );
            Err(RolloutError::Stalled {
                service: spec.name.clone(),
                revision: status.revision.clone(),
                reason: status
                    .reason
                    .unwrap_or_else(|| "new replicas never became healthy".to_string()),
                rolled_back,
            })
        }
    }
}

/// Create the service and wait for its first deployment to settle.
pub async fn create_service(
    scope: &Scope<'_>,
    spec: &ManagedServiceSpec,
    cluster: &Cluster,
    definition: &WorkloadDefinition,
    placement: Placement,
    pool: &TargetPool,
) -> RolloutResult<ManagedService> {
    spec.policy.validate(spec.desired_count)?;

    let handle = scope
        .create(
            ResourceKind::ManagedService,
            &spec.name,
            service_spec(spec, cluster, definition, &placement, pool),
        )
        .await?;
    let deployment = read_deployment(&handle, spec)?;

    info!(
        service = %spec.name,
        id = %handle.id,
        revision = %definition.revision,
        desired = spec.desired_count,
        "managed service steady"
    );
    Ok(ManagedService {
        id: handle.id,
        name: spec.name.clone(),
        cluster_id: cluster.id.clone(),
        definition_id: definition.id.clone(),
        revision: definition.revision.clone(),
        placement,
        target_pool_id: pool.id.clone(),
        desired_count: spec.desired_count,
        policy: spec.policy.clone(),
        deployment,
    })
}

/// Point an existing service at a new definition (or count, or policy)
/// and wait for the rolling update to settle.
pub async fn update_service(
    scope: &Scope<'_>,
    existing: &ManagedService,
    spec: &ManagedServiceSpec,
    cluster: &Cluster,
    definition: &WorkloadDefinition,
    placement: Placement,
    pool: &TargetPool,
) -> RolloutResult<ManagedService> {
    spec.policy.validate(spec.desired_count)?;

    info!(
        service = %spec.name,
        from = %existing.revision,
        to = %definition.revision,
        "rolling update requested"
    );
    let handle = scope
        .update(
            &existing.id,
            &service_spec(spec, cluster, definition, &placement, pool),
        )
        .await?;
    let deployment = read_deployment(&handle, spec)?;

    info!(service = %spec.name, revision = %definition.revision, "managed service steady");
    Ok(ManagedService {
        id: existing.id.clone(),
        name: spec.name.clone(),
        cluster_id: cluster.id.clone(),
        definition_id: definition.id.clone(),
        revision: definition.revision.clone(),
        placement,
        target_pool_id: pool.id.clone(),
        desired_count: spec.desired_count,
        policy: spec.policy.clone(),
        deployment,
    })
}

#[cfg(test)]
mod tests {
    use stackgrid_cloud::ResourceState;

    use super::*;

    fn spec() -> ManagedServiceSpec {
        ManagedServiceSpec {
            name: "web".to_string(),
            desired_count: 2,
            container_name: "app".to_string(),
            container_port: 3000,
            policy: DeploymentPolicy::default(),
        }
    }

    fn handle(deployment: serde_json::Value) -> ResourceHandle {
        ResourceHandle {
            id: "svc-1".into(),
            kind: ResourceKind::ManagedService,
            name: "web".to_string(),
            state: ResourceState::Available,
            attributes: json!({ "deployment": deployment }),
        }
    }

    #[test]
    fn steady_deployment_is_read() {
        let status = read_deployment(
            &handle(json!({
                "state": "steady",
                "revision": "web:2",
                "max_running": 4,
                "min_healthy": 2,
                "reason": null,
            })),
            &spec(),
        )
        .unwrap();
        assert_eq!(status.state, DeploymentState::Steady);
        assert_eq!(status.max_running, 4);
    }

    #[test]
    fn stalled_deployment_is_an_error() {
        let err = read_deployment(
            &handle(json!({
                "state": "rolled_back",
                "revision": "web:3",
                "max_running": 4,
                "min_healthy": 2,
                "reason": "0/2 healthy",
            })),
            &spec(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::Stalled {
                rolled_back: true,
                ..
            }
        ));
    }

    #[test]
    fn missing_deployment_attribute() {
        let mut h = handle(json!(null));
        h.attributes = json!({});
        assert!(matches!(
            read_deployment(&h, &spec()),
            Err(RolloutError::MissingAttribute { .. })
        ));
    }
}

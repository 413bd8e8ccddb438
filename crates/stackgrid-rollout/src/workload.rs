//! Deployable unit: workload definition and its leaf dependencies.
//!
//! A definition is immutable per revision. Changing the image or the
//! shape registers a new definition rather than editing the old one, and
//! the image must be pinned by digest so a revision always means the
//! same bytes.

use serde::{Deserialize, Serialize};
use serde_json::json;
use stackgrid_cloud::Scope;
use stackgrid_core::{ImageRef, ResourceId, ResourceKind};
use tracing::info;

use crate::error::{RolloutError, RolloutResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSink {
    pub id: ResourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRole {
    pub id: ResourceId,
    pub name: String,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ResourceId,
    pub name: String,
}

/// CPU units and memory in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub cpu: u32,
    pub memory: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDefinitionSpec {
    pub family: String,
    pub container_name: String,
    pub image: ImageRef,
    pub shape: ResourceShape,
    pub container_port: u16,
    pub log_stream_prefix: String,
}

/// A registered definition revision. Output of the `WorkloadDefinition` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    pub id: ResourceId,
    /// `<family>:<n>` as reported by the platform.
    pub revision: String,
    pub spec: WorkloadDefinitionSpec,
    pub log_sink_id: ResourceId,
    pub execution_role_id: ResourceId,
}

pub async fn create_log_sink(scope: &Scope<'_>, name: &str) -> RolloutResult<LogSink> {
    let handle = scope
        .create(ResourceKind::LogSink, name, json!({ "name": name }))
        .await?;
    info!(sink = %name, id = %handle.id, "log sink ready");
    Ok(LogSink {
        id: handle.id,
        name: name.to_string(),
    })
}

/// Role the platform assumes to pull the image and ship logs.
pub async fn create_execution_role(scope: &Scope<'_>, name: &str) -> RolloutResult<ExecutionRole> {
    let policies = vec![
        "registry-read".to_string(),
        "log-write".to_string(),
    ];
    let handle = scope
        .create(
            ResourceKind::ExecutionRole,
            name,
            json!({
                "name": name,
                "trusted_service": "workload-tasks",
                "policies": policies,
            }),
        )
        .await?;
    info!(role = %name, id = %handle.id, "execution role ready");
    Ok(ExecutionRole {
        id: handle.id,
        name: name.to_string(),
        policies,
    })
}

pub async fn create_cluster(scope: &Scope<'_>, name: &str) -> RolloutResult<Cluster> {
    let handle = scope
        .create(ResourceKind::Cluster, name, json!({ "name": name }))
        .await?;
    info!(cluster = %name, id = %handle.id, "cluster ready");
    Ok(Cluster {
        id: handle.id,
        name: name.to_string(),
    })
}

/// Register a new definition revision.
pub async fn register_definition(
    scope: &Scope<'_>,
    spec: &WorkloadDefinitionSpec,
    sink: &LogSink,
    role: &ExecutionRole,
) -> RolloutResult<WorkloadDefinition> {
    if !spec.image.is_immutable() {
        return Err(RolloutError::MutableImage(spec.image.to_string()));
    }

    let handle = scope
        .create(
            ResourceKind::WorkloadDefinition,
            &spec.family,
            json!({
                "family": spec.family,
                "network_mode": "awsvpc",
                "cpu": spec.shape.cpu,
                "memory": spec.shape.memory,
                "execution_role_id": role.id,
                "containers": [{
                    "name": spec.container_name,
                    "image": spec.image.to_string(),
                    "essential": true,
                    "port_mappings": [{ "container_port": spec.container_port, "protocol": "tcp" }],
                    "log": {
                        "sink_id": sink.id,
                        "stream_prefix": spec.log_stream_prefix,
                    },
                }],
            }),
        )
        .await?;

    let revision = handle
        .attribute("revision")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", spec.family, handle.id));
    info!(family = %spec.family, %revision, image = %spec.image, "workload definition registered");
    Ok(WorkloadDefinition {
        id: handle.id,
        revision,
        spec: spec.clone(),
        log_sink_id: sink.id.clone(),
        execution_role_id: role.id.clone(),
    })
}

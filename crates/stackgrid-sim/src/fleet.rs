//! Runs a managed service deployment on the fleet simulator.
//!
//! The simulated platform reads the same service spec the builder sends:
//! desired count, health check, deregistration delay and deployment
//! policy. The resulting rollout report becomes the service's
//! `deployment` attribute.

use std::time::Duration;

use serde_json::{Value, json};
use stackgrid_cloud::{CloudError, CloudResult};
use stackgrid_health::ProbePolicy;
use stackgrid_rollout::{
    DeploymentPolicy, DeploymentState, DeploymentStatus, FleetConfig, FleetSimulator,
    RolloutPhase, RolloutReport,
};
use tracing::debug;

/// Time from launch until a replica's own readiness probe passes.
const STARTUP: Duration = Duration::from_secs(10);

/// What the platform remembers about a service between deployments.
#[derive(Debug, Clone, Default)]
pub(crate) struct FleetMemory {
    pub serving_revision: Option<String>,
    pub desired: u32,
}

fn malformed(field: &str) -> CloudError {
    CloudError::Rejected(format!("malformed managed service spec: {field}"))
}

fn u64_field(spec: &Value, pointer: &str) -> CloudResult<u64> {
    spec.pointer(pointer)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(pointer))
}

fn fleet_config(spec: &Value) -> CloudResult<FleetConfig> {
    let probe: ProbePolicy = spec
        .get("health_check")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| malformed("/health_check"))?;
    let policy = DeploymentPolicy {
        max_surge_percent: u64_field(spec, "/deployment/max_surge_percent")? as u32,
        min_healthy_percent: u64_field(spec, "/deployment/min_healthy_percent")? as u32,
        rollback_on_stall: spec
            .pointer("/deployment/rollback_on_stall")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        stall_timeout: Duration::from_millis(u64_field(spec, "/deployment/stall_timeout_ms")?),
    };
    Ok(FleetConfig {
        desired: u64_field(spec, "/desired_count")? as u32,
        policy,
        probe,
        deregistration_delay: Duration::from_millis(u64_field(spec, "/deregistration_delay_ms")?),
        startup: STARTUP,
    })
}

fn deployment_status(report: &RolloutReport) -> DeploymentStatus {
    let (state, reason) = match &report.phase {
        RolloutPhase::Completed => (DeploymentState::Steady, None),
        RolloutPhase::RolledBack { reason } => (DeploymentState::RolledBack, Some(reason.clone())),
        RolloutPhase::Stalled { reason } => (DeploymentState::Stalled, Some(reason.clone())),
        RolloutPhase::Pending | RolloutPhase::Progressing => (
            DeploymentState::Stalled,
            Some("rollout did not finish".to_string()),
        ),
    };
    DeploymentStatus {
        state,
        revision: report.revision.clone(),
        max_running: report.max_running,
        min_healthy: report.min_healthy,
        reason,
    }
}

/// Deploy the revision named in `spec` on top of `memory`.
///
/// Returns the service attributes and the updated memory.
pub(crate) fn deploy(
    service: &str,
    spec: &Value,
    memory: &FleetMemory,
    unhealthy: bool,
) -> CloudResult<(Value, FleetMemory)> {
    let revision = spec
        .get("revision")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("/revision"))?;
    let config = fleet_config(spec)?;
    let desired = config.desired;

    let mut fleet = FleetSimulator::new(config);
    if let Some(previous) = &memory.serving_revision {
        fleet.seed(previous, memory.desired);
    }
    if unhealthy {
        fleet.mark_unhealthy(revision);
    }
    let report = fleet.roll(service, revision);
    let status = deployment_status(&report);

    let peak_running = report.samples.iter().map(|s| s.running).max().unwrap_or(0);
    let lowest_healthy = report.samples.iter().map(|s| s.healthy).min().unwrap_or(0);
    debug!(
        %service,
        %revision,
        state = ?status.state,
        peak_running,
        lowest_healthy,
        "simulated deployment finished"
    );

    let next = if status.state == DeploymentState::Steady {
        FleetMemory {
            serving_revision: Some(revision.to_string()),
            desired,
        }
    } else {
        memory.clone()
    };
    let attributes = json!({
        "deployment": status,
        "serving_revision": next.serving_revision,
        "peak_running": peak_running,
        "lowest_healthy": lowest_healthy,
        "elapsed_ms": report.elapsed.as_millis() as u64,
    });
    Ok((attributes, next))
}

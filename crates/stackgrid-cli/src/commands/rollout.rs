//! `stackctl rollout` — run a rolling update on the fleet simulator.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use stackgrid_core::config::ResolvedStack;
use stackgrid_health::ProbePolicy;
use stackgrid_rollout::{DeploymentPolicy, FleetConfig, FleetSimulator, RolloutPhase, RolloutReport};

use super::{check_format, load_stack};

/// Time from launch until a replica's own readiness probe passes.
const STARTUP: Duration = Duration::from_secs(10);

/// A simulated rollout together with the bounds it had to respect.
#[derive(Serialize)]
struct Observed {
    desired: u32,
    running_cap: u32,
    healthy_floor: u32,
    within_bounds: bool,
    report: RolloutReport,
}

pub fn rollout(config: &Path, desired: Option<u32>, unhealthy: bool, format: &str) -> Result<()> {
    check_format(format)?;
    let stack = load_stack(config)?;
    let observed = simulate(&stack, desired, unhealthy)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&observed)?);
    } else {
        print!("{}", render(&observed));
    }
    if !observed.within_bounds {
        bail!("rollout left the policy bounds");
    }
    Ok(())
}

fn simulate(stack: &ResolvedStack, desired: Option<u32>, unhealthy: bool) -> Result<Observed> {
    let desired = desired.unwrap_or(stack.service.desired_count);
    let policy = DeploymentPolicy::from(&stack.service);
    policy.validate(desired)?;

    let family = format!("{}-app", stack.name);
    let (old, new) = (format!("{family}:1"), format!("{family}:2"));
    let mut fleet = FleetSimulator::new(FleetConfig {
        desired,
        policy: policy.clone(),
        probe: ProbePolicy::from(&stack.target_pool),
        deregistration_delay: stack.target_pool.deregistration_delay,
        startup: STARTUP,
    });
    fleet.seed(&old, desired);
    if unhealthy {
        fleet.mark_unhealthy(&new);
    }
    let report = fleet.roll(&format!("{}-service", stack.name), &new);

    let running_cap = policy.running_cap(desired);
    let healthy_floor = policy.min_healthy(desired);
    let within_bounds = report.max_running <= running_cap && report.min_healthy >= healthy_floor;
    Ok(Observed {
        desired,
        running_cap,
        healthy_floor,
        within_bounds,
        report,
    })
}

fn render(observed: &Observed) -> String {
    let report = &observed.report;
    let phase = match &report.phase {
        RolloutPhase::Completed => "completed".to_string(),
        RolloutPhase::Stalled { reason } => format!("stalled: {reason}"),
        RolloutPhase::RolledBack { reason } => format!("rolled back: {reason}"),
        RolloutPhase::Pending | RolloutPhase::Progressing => "unfinished".to_string(),
    };
    let mut out = format!(
        "Rollout of {} to {}: {phase} after {:?}\n",
        report.service, report.revision, report.elapsed
    );
    out.push_str(&format!(
        "  running: max {} (cap {})\n  healthy: min {} (floor {})\n",
        report.max_running, observed.running_cap, report.min_healthy, observed.healthy_floor
    ));
    for (revision, count) in &report.serving {
        out.push_str(&format!("  serving {revision}: {count}\n"));
    }
    out
}

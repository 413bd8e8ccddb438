//! Target pool definition and membership.
//!
//! Membership runs on a logical clock (`Duration` since an arbitrary
//! origin) so the rollout simulator can drive it step by step. A
//! deregistered target drains for the deregistration delay: it finishes
//! in-flight requests but no longer counts as healthy and receives no new
//! traffic.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackgrid_core::ResourceId;
use stackgrid_core::config::TargetPoolSettings;
use stackgrid_health::{HealthStatus, HealthTracker, ProbePolicy, ProbeResult};
use tracing::debug;

use crate::router::ListenerProtocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPoolSpec {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    /// Targets are registered by IP, as awsvpc-style replicas require.
    pub target_type: String,
    pub health: ProbePolicy,
    /// HTTP codes counted as a passing probe.
    pub matcher: String,
    pub deregistration_delay: Duration,
}

impl TargetPoolSpec {
    pub fn from_settings(name: &str, port: u16, settings: &TargetPoolSettings) -> Self {
        Self {
            name: name.to_string(),
            port,
            protocol: ListenerProtocol::Http,
            target_type: "ip".to_string(),
            health: ProbePolicy::from(settings),
            matcher: "200".to_string(),
            deregistration_delay: settings.deregistration_delay,
        }
    }
}

/// A created target pool. Output of the `TargetPool` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPool {
    pub id: ResourceId,
    pub router_id: ResourceId,
    pub network_id: ResourceId,
    pub spec: TargetPoolSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Registered, healthy threshold not yet reached.
    Initial,
    Healthy,
    Unhealthy,
    Draining,
}

#[derive(Debug, Clone)]
struct Target {
    tracker: HealthTracker,
    draining_until: Option<Duration>,
}

impl Target {
    fn state(&self) -> TargetState {
        if self.draining_until.is_some() {
            return TargetState::Draining;
        }
        match self.tracker.status() {
            HealthStatus::Healthy => TargetState::Healthy,
            HealthStatus::Unhealthy => TargetState::Unhealthy,
            HealthStatus::Unknown => TargetState::Initial,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolMembership {
    policy: ProbePolicy,
    deregistration_delay: Duration,
    targets: BTreeMap<String, Target>,
}

impl PoolMembership {
    pub fn new(policy: ProbePolicy, deregistration_delay: Duration) -> Self {
        Self {
            policy,
            deregistration_delay,
            targets: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, target: &str) {
        self.targets.entry(target.to_string()).or_insert_with(|| Target {
            tracker: HealthTracker::new(&self.policy),
            draining_until: None,
        });
        debug!(%target, "target registered");
    }

    /// Feed one health-check result. Draining targets are no longer probed.
    pub fn record(&mut self, target: &str, result: ProbeResult) -> Option<TargetState> {
        let entry = self.targets.get_mut(target)?;
        if entry.draining_until.is_none() {
            entry.tracker.record(result);
        }
        Some(entry.state())
    }

    /// Start draining `target`; it leaves the pool at `now + delay`.
    pub fn deregister(&mut self, target: &str, now: Duration) {
        if let Some(entry) = self.targets.get_mut(target) {
            if entry.draining_until.is_none() {
                entry.draining_until = Some(now + self.deregistration_delay);
                debug!(%target, delay_ms = self.deregistration_delay.as_millis() as u64, "target draining");
            }
        }
    }

    /// Drop every target whose drain window has closed. Returns them.
    pub fn sweep(&mut self, now: Duration) -> Vec<String> {
        let done: Vec<String> = self
            .targets
            .iter()
            .filter(|(_, t)| matches!(t.draining_until, Some(until) if until <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            self.targets.remove(id);
        }
        done
    }

    pub fn state(&self, target: &str) -> Option<TargetState> {
        self.targets.get(target).map(Target::state)
    }

    pub fn is_registered(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    /// Registered and passing health checks, and not draining.
    pub fn is_healthy(&self, target: &str) -> bool {
        self.state(target) == Some(TargetState::Healthy)
    }

    pub fn healthy_count(&self) -> usize {
        self.targets
            .values()
            .filter(|t| t.state() == TargetState::Healthy)
            .count()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

//! Fleet simulator for rolling updates.
//!
//! Runs a [`RollingUpdate`] against simulated replicas on a logical clock
//! that advances one health-check interval per tick. A replica counts as
//! healthy only once its readiness probe passed and the target pool
//! reports it healthy, which takes `healthy_threshold` consecutive
//! passing checks. Every tick records running and healthy counts so
//! callers can check the policy bounds held throughout.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackgrid_edge::{PoolMembership, TargetState};
use stackgrid_health::{ProbePolicy, ProbeResult};
use tracing::debug;

use crate::controller::{FleetView, RollingUpdate, RolloutAction, RolloutPhase};
use crate::policy::DeploymentPolicy;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub desired: u32,
    pub policy: DeploymentPolicy,
    pub probe: ProbePolicy,
    pub deregistration_delay: Duration,
    /// Time from launch until the container's own readiness probe passes.
    pub startup: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaPhase {
    Starting { ready_at: Duration },
    Serving,
    Draining,
}

#[derive(Debug, Clone)]
struct Replica {
    id: String,
    revision: String,
    phase: ReplicaPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSample {
    pub at: Duration,
    pub running: u32,
    pub healthy: u32,
}

/// What happened during one simulated rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutReport {
    pub service: String,
    pub revision: String,
    pub phase: RolloutPhase,
    pub max_running: u32,
    pub min_healthy: u32,
    pub elapsed: Duration,
    /// Healthy replicas per revision when the rollout finished.
    pub serving: BTreeMap<String, u32>,
    pub samples: Vec<FleetSample>,
}

impl RolloutReport {
    pub fn is_steady(&self) -> bool {
        self.phase == RolloutPhase::Completed
    }
}

pub struct FleetSimulator {
    config: FleetConfig,
    now: Duration,
    replicas: Vec<Replica>,
    pool: PoolMembership,
    unhealthy_revisions: HashSet<String>,
    next_id: u32,
}

impl FleetSimulator {
    pub fn new(config: FleetConfig) -> Self {
        let pool = PoolMembership::new(config.probe.clone(), config.deregistration_delay);
        Self {
            config,
            now: Duration::ZERO,
            replicas: Vec::new(),
            pool,
            unhealthy_revisions: HashSet::new(),
            next_id: 0,
        }
    }

    /// Replicas of `revision` will fail every health check.
    pub fn mark_unhealthy(&mut self, revision: &str) {
        self.unhealthy_revisions.insert(revision.to_string());
    }

    /// Start from `count` healthy, registered replicas of `revision`.
    pub fn seed(&mut self, revision: &str, count: u32) {
        for _ in 0..count {
            let id = self.launch(revision);
            self.pool.register(&id);
            for _ in 0..self.config.probe.healthy_threshold {
                self.pool.record(&id, ProbeResult::Healthy);
            }
            if let Some(replica) = self.replicas.iter_mut().find(|r| r.id == id) {
                replica.phase = ReplicaPhase::Serving;
            }
        }
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn running(&self) -> u32 {
        self.replicas.len() as u32
    }

    pub fn healthy(&self) -> u32 {
        self.replicas.iter().filter(|r| self.is_healthy(r)).count() as u32
    }

    /// Healthy replicas per revision.
    pub fn serving(&self) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        for replica in self.replicas.iter().filter(|r| self.is_healthy(r)) {
            *out.entry(replica.revision.clone()).or_insert(0) += 1;
        }
        out
    }

    /// The revision most replicas run, if any.
    pub fn current_revision(&self) -> Option<String> {
        self.serving()
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(rev, _)| rev)
    }

    fn is_healthy(&self, replica: &Replica) -> bool {
        replica.phase == ReplicaPhase::Serving && self.pool.is_healthy(&replica.id)
    }

    fn launch(&mut self, revision: &str) -> String {
        self.next_id += 1;
        let id = format!("{revision}-{}", self.next_id);
        self.replicas.push(Replica {
            id: id.clone(),
            revision: revision.to_string(),
            phase: ReplicaPhase::Starting {
                ready_at: self.now + self.config.startup,
            },
        });
        id
    }

    fn view(&self, new_revision: &str) -> FleetView {
        let mut view = FleetView::default();
        for replica in &self.replicas {
            if replica.phase == ReplicaPhase::Draining {
                view.draining += 1;
                continue;
            }
            let healthy = self.is_healthy(replica);
            if replica.revision == new_revision {
                view.new_active += 1;
                if healthy {
                    view.new_healthy += 1;
                } else if self.pool.state(&replica.id) == Some(TargetState::Unhealthy) {
                    view.new_failed += 1;
                }
            } else {
                view.old_active += 1;
                if healthy {
                    view.old_healthy += 1;
                }
            }
        }
        view
    }

    fn drain(&mut self, id: &str) {
        if self.pool.is_registered(id) {
            self.pool.deregister(id, self.now);
            if let Some(replica) = self.replicas.iter_mut().find(|r| r.id == id) {
                replica.phase = ReplicaPhase::Draining;
            }
        } else {
            // Never registered, so nothing is in flight.
            self.replicas.retain(|r| r.id != id);
        }
    }

    fn apply(&mut self, action: RolloutAction, new_revision: &str) {
        match action {
            RolloutAction::Launch { count } => {
                for _ in 0..count {
                    self.launch(new_revision);
                }
            }
            RolloutAction::DrainOld { count } => {
                let mut old: Vec<(bool, String)> = self
                    .replicas
                    .iter()
                    .filter(|r| r.revision != new_revision && r.phase != ReplicaPhase::Draining)
                    .map(|r| (self.is_healthy(r), r.id.clone()))
                    .collect();
                // Unhealthy first.
                old.sort();
                for (_, id) in old.into_iter().take(count as usize) {
                    self.drain(&id);
                }
            }
            RolloutAction::ReplaceFailed { count } => {
                let failed: Vec<String> = self
                    .replicas
                    .iter()
                    .filter(|r| {
                        r.revision == new_revision
                            && r.phase != ReplicaPhase::Draining
                            && self.pool.state(&r.id) == Some(TargetState::Unhealthy)
                    })
                    .map(|r| r.id.clone())
                    .take(count as usize)
                    .collect();
                for id in failed {
                    self.drain(&id);
                }
            }
            RolloutAction::RollBack => {
                let new: Vec<String> = self
                    .replicas
                    .iter()
                    .filter(|r| r.revision == new_revision && r.phase != ReplicaPhase::Draining)
                    .map(|r| r.id.clone())
                    .collect();
                for id in new {
                    self.drain(&id);
                }
            }
        }
    }

    /// Advance one health-check interval.
    fn tick(&mut self) {
        self.now += self.config.probe.interval;
        let now = self.now;

        for replica in &mut self.replicas {
            if let ReplicaPhase::Starting { ready_at } = replica.phase {
                if ready_at <= now {
                    replica.phase = ReplicaPhase::Serving;
                    self.pool.register(&replica.id);
                }
            }
        }
        for replica in &self.replicas {
            if replica.phase == ReplicaPhase::Serving {
                let result = if self.unhealthy_revisions.contains(&replica.revision) {
                    ProbeResult::Failed
                } else {
                    ProbeResult::Healthy
                };
                self.pool.record(&replica.id, result);
            }
        }

        let gone: HashSet<String> = self.pool.sweep(now).into_iter().collect();
        if !gone.is_empty() {
            self.replicas.retain(|r| !gone.contains(&r.id));
        }
    }

    fn sample(&self, samples: &mut Vec<FleetSample>) {
        samples.push(FleetSample {
            at: self.now,
            running: self.running(),
            healthy: self.healthy(),
        });
    }

    /// Roll the fleet to `new_revision` until the rollout finishes.
    pub fn roll(&mut self, service: &str, new_revision: &str) -> RolloutReport {
        let old_revision = self.current_revision().filter(|r| r != new_revision);
        let mut update = RollingUpdate::new(
            service,
            old_revision.as_deref(),
            new_revision,
            self.config.desired,
            self.config.policy.clone(),
        );
        let started = self.now;
        update.start(started);

        let mut samples = Vec::new();
        self.sample(&mut samples);

        // The controller always finishes by the stall timeout; this is a guard.
        let interval = self.config.probe.interval.max(Duration::from_millis(1));
        let max_ticks = (self.config.policy.stall_timeout.as_millis() / interval.as_millis()) as u64
            * 4
            + 100;

        for _ in 0..max_ticks {
            let view = self.view(new_revision);
            for action in update.step(&view, self.now) {
                self.apply(action, new_revision);
            }
            self.sample(&mut samples);
            if update.phase.is_finished() {
                break;
            }
            self.tick();
            self.sample(&mut samples);
        }

        // Let drains finish so old or rolled-back replicas leave the pool.
        while self
            .replicas
            .iter()
            .any(|r| r.phase == ReplicaPhase::Draining)
        {
            self.tick();
            self.sample(&mut samples);
        }

        let phase = if update.phase.is_finished() {
            update.phase.clone()
        } else {
            RolloutPhase::Stalled {
                reason: "rollout did not finish".to_string(),
            }
        };
        debug!(%service, revision = %new_revision, ?phase, "simulated rollout finished");

        RolloutReport {
            service: service.to_string(),
            revision: new_revision.to_string(),
            phase,
            max_running: samples.iter().map(|s| s.running).max().unwrap_or(0),
            min_healthy: samples.iter().map(|s| s.healthy).min().unwrap_or(0),
            elapsed: self.now.saturating_sub(started),
            serving: self.serving(),
            samples,
        }
    }
}

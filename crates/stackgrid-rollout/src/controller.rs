//! Rolling update controller — drives the rollout state machine.
//!
//! Each step looks at a [`FleetView`] and returns the launches and drains
//! that keep the fleet inside the policy:
//!
//! - running replicas (pending, serving or draining) never exceed
//!   `max(max_running, desired)`;
//! - healthy replicas never drop below `min_healthy` because of a drain.
//!
//! A rollout that sees no new healthy replica for the stall timeout is
//! stalled. Old replicas keep serving; the new revision is drained only
//! when the policy asks for rollback.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::policy::DeploymentPolicy;

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Rollout not started.
    Pending,
    /// Replacing replicas.
    Progressing,
    /// Desired count of the new revision healthy, old revision gone.
    Completed,
    /// New replicas never became healthy; old ones keep serving.
    Stalled { reason: String },
    /// Stalled and the new revision was drained.
    RolledBack { reason: String },
}

impl RolloutPhase {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RolloutPhase::Pending | RolloutPhase::Progressing)
    }
}

/// Counts the controller decides on. "Active" excludes draining replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetView {
    pub old_active: u32,
    pub old_healthy: u32,
    pub new_active: u32,
    pub new_healthy: u32,
    /// New replicas whose health checks settled on unhealthy.
    pub new_failed: u32,
    pub draining: u32,
}

impl FleetView {
    pub fn running(&self) -> u32 {
        self.old_active + self.new_active + self.draining
    }

    pub fn healthy(&self) -> u32 {
        self.old_healthy + self.new_healthy
    }
}

/// What the platform should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutAction {
    /// Start `count` replicas of the new revision.
    Launch { count: u32 },
    /// Deregister `count` old replicas, unhealthy ones first.
    DrainOld { count: u32 },
    /// Deregister failed new replicas so they can be replaced.
    ReplaceFailed { count: u32 },
    /// Deregister every new replica.
    RollBack,
}

/// A rolling update in progress.
#[derive(Debug, Clone)]
pub struct RollingUpdate {
    pub service: String,
    pub old_revision: Option<String>,
    pub new_revision: String,
    pub desired: u32,
    pub policy: DeploymentPolicy,
    pub phase: RolloutPhase,
    started_at: Option<Duration>,
    last_progress_at: Duration,
    best_new_healthy: u32,
}

impl RollingUpdate {
    pub fn new(
        service: &str,
        old_revision: Option<&str>,
        new_revision: &str,
        desired: u32,
        policy: DeploymentPolicy,
    ) -> Self {
        Self {
            service: service.to_string(),
            old_revision: old_revision.map(str::to_string),
            new_revision: new_revision.to_string(),
            desired,
            policy,
            phase: RolloutPhase::Pending,
            started_at: None,
            last_progress_at: Duration::ZERO,
            best_new_healthy: 0,
        }
    }

    /// Start the rollout at logical time `now`.
    pub fn start(&mut self, now: Duration) {
        self.started_at = Some(now);
        self.last_progress_at = now;
        self.phase = RolloutPhase::Progressing;
        info!(
            service = %self.service,
            from = self.old_revision.as_deref().unwrap_or("-"),
            to = %self.new_revision,
            desired = self.desired,
            max_running = self.policy.running_cap(self.desired),
            min_healthy = self.policy.min_healthy(self.desired),
            "started rolling update"
        );
    }

    pub fn started_at(&self) -> Option<Duration> {
        self.started_at
    }

    /// Advance the rollout by one step.
    pub fn step(&mut self, view: &FleetView, now: Duration) -> Vec<RolloutAction> {
        if self.phase != RolloutPhase::Progressing {
            return Vec::new();
        }

        if view.new_healthy > self.best_new_healthy {
            self.best_new_healthy = view.new_healthy;
            self.last_progress_at = now;
        }

        if view.new_healthy >= self.desired && view.old_active == 0 && view.draining == 0 {
            self.phase = RolloutPhase::Completed;
            info!(service = %self.service, revision = %self.new_revision, "rolling update completed");
            return Vec::new();
        }

        if view.new_healthy < self.desired
            && now.saturating_sub(self.last_progress_at) >= self.policy.stall_timeout
        {
            let reason = format!(
                "{}/{} replicas of {} healthy after {:?}",
                view.new_healthy,
                self.desired,
                self.new_revision,
                now.saturating_sub(self.last_progress_at)
            );
            warn!(service = %self.service, %reason, rollback = self.policy.rollback_on_stall, "rollout stalled");
            if self.policy.rollback_on_stall {
                self.phase = RolloutPhase::RolledBack { reason };
                return vec![RolloutAction::RollBack];
            }
            self.phase = RolloutPhase::Stalled { reason };
            return Vec::new();
        }

        let cap = self.policy.running_cap(self.desired);
        let floor = self.policy.min_healthy(self.desired);
        let mut actions = Vec::new();

        if view.new_failed > 0 {
            actions.push(RolloutAction::ReplaceFailed {
                count: view.new_failed,
            });
        }
        let new_active = view.new_active.saturating_sub(view.new_failed);

        // Old replicas go when there is surplus capacity, or to make room
        // for launches blocked by the cap.
        let old_unhealthy = view.old_active.saturating_sub(view.old_healthy);
        let surplus = (view.old_active + new_active).saturating_sub(self.desired);
        let still_needed = self.desired.saturating_sub(new_active);
        let room = cap.saturating_sub(view.running()) + view.draining;
        let make_room = still_needed.saturating_sub(room);
        let affordable = old_unhealthy + view.healthy().saturating_sub(floor);
        let drain = surplus
            .max(make_room)
            .min(view.old_active)
            .min(affordable);
        if drain > 0 {
            actions.push(RolloutAction::DrainOld { count: drain });
        }

        let launch = cap.saturating_sub(view.running()).min(still_needed);
        if launch > 0 {
            actions.push(RolloutAction::Launch { count: launch });
        }

        debug!(
            service = %self.service,
            running = view.running(),
            healthy = view.healthy(),
            launch,
            drain,
            "rollout step"
        );
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_surge_percent: u32, min_healthy_percent: u32) -> DeploymentPolicy {
        DeploymentPolicy {
            max_surge_percent,
            min_healthy_percent,
            rollback_on_stall: false,
            stall_timeout: Duration::from_secs(300),
        }
    }

    fn steady_old(n: u32) -> FleetView {
        FleetView {
            old_active: n,
            old_healthy: n,
            ..Default::default()
        }
    }

    #[test]
    fn surge_launches_full_new_set() {
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 4, policy(200, 100));
        rollout.start(Duration::ZERO);
        let actions = rollout.step(&steady_old(4), Duration::ZERO);
        assert_eq!(actions, vec![RolloutAction::Launch { count: 4 }]);
    }

    #[test]
    fn old_drained_only_once_new_is_healthy() {
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 4, policy(200, 100));
        rollout.start(Duration::ZERO);

        // New replicas pending: no healthy headroom, nothing drains.
        let pending = FleetView {
            new_active: 4,
            ..steady_old(4)
        };
        assert!(rollout.step(&pending, Duration::from_secs(30)).is_empty());

        // Two new healthy: two old may go.
        let partial = FleetView {
            new_healthy: 2,
            ..pending
        };
        assert_eq!(
            rollout.step(&partial, Duration::from_secs(60)),
            vec![RolloutAction::DrainOld { count: 2 }]
        );
    }

    #[test]
    fn no_surge_drains_to_floor_first() {
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 4, policy(100, 50));
        rollout.start(Duration::ZERO);
        let actions = rollout.step(&steady_old(4), Duration::ZERO);
        assert_eq!(actions, vec![RolloutAction::DrainOld { count: 2 }]);
    }

    #[test]
    fn completes_when_old_gone() {
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 2, policy(200, 100));
        rollout.start(Duration::ZERO);
        let done = FleetView {
            new_active: 2,
            new_healthy: 2,
            ..Default::default()
        };
        assert!(rollout.step(&done, Duration::from_secs(90)).is_empty());
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }

    #[test]
    fn stalls_without_rollback() {
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 2, policy(200, 100));
        rollout.start(Duration::ZERO);
        let stuck = FleetView {
            new_active: 2,
            ..steady_old(2)
        };
        rollout.step(&stuck, Duration::from_secs(100));
        assert_eq!(rollout.phase, RolloutPhase::Progressing);

        assert!(rollout.step(&stuck, Duration::from_secs(300)).is_empty());
        assert!(matches!(rollout.phase, RolloutPhase::Stalled { .. }));

        // Finished rollouts do nothing.
        assert!(rollout.step(&stuck, Duration::from_secs(400)).is_empty());
    }

    #[test]
    fn stalls_with_rollback() {
        let mut p = policy(200, 100);
        p.rollback_on_stall = true;
        let mut rollout = RollingUpdate::new("svc", Some("r1"), "r2", 2, p);
        rollout.start(Duration::ZERO);
        let stuck = FleetView {
            new_active: 2,
            ..steady_old(2)
        };
        assert_eq!(
            rollout.step(&stuck, Duration::from_secs(300)),
            vec![RolloutAction::RollBack]
        );
        assert!(matches!(rollout.phase, RolloutPhase::RolledBack { .. }));
    }

    #[test]
    fn failed_new_replicas_are_replaced() {
        let mut rollout = RollingUpdate::new("svc", None, "r1", 2, policy(200, 100));
        rollout.start(Duration::ZERO);
        let view = FleetView {
            new_active: 2,
            new_failed: 1,
            ..Default::default()
        };
        let actions = rollout.step(&view, Duration::from_secs(30));
        assert_eq!(actions[0], RolloutAction::ReplaceFailed { count: 1 });
    }

    #[test]
    fn pending_does_nothing() {
        let mut rollout = RollingUpdate::new("svc", None, "r1", 2, policy(200, 100));
        assert!(rollout.step(&FleetView::default(), Duration::ZERO).is_empty());
        assert_eq!(rollout.phase, RolloutPhase::Pending);
        assert!(rollout.started_at().is_none());
    }
}

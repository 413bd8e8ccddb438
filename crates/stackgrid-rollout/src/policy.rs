//! Deployment policy: bounded surge and a healthy floor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackgrid_core::config::ServiceSettings;

use crate::error::{RolloutError, RolloutResult};

/// How a managed service replaces replicas during an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    /// Upper bound on running replicas, as a percentage of desired.
    pub max_surge_percent: u32,
    /// Lower bound on healthy replicas, as a percentage of desired.
    pub min_healthy_percent: u32,
    /// Drain the new revision when the rollout stalls.
    pub rollback_on_stall: bool,
    /// No new healthy replica for this long means the rollout stalled.
    pub stall_timeout: Duration,
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            max_surge_percent: 200,
            min_healthy_percent: 100,
            rollback_on_stall: false,
            stall_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&ServiceSettings> for DeploymentPolicy {
    fn from(settings: &ServiceSettings) -> Self {
        Self {
            max_surge_percent: settings.max_surge_percent,
            min_healthy_percent: settings.min_healthy_percent,
            rollback_on_stall: settings.rollback_on_stall,
            stall_timeout: settings.rollout_timeout,
        }
    }
}

impl DeploymentPolicy {
    /// `floor(desired × max_surge / 100)`.
    pub fn max_running(&self, desired: u32) -> u32 {
        (u64::from(desired) * u64::from(self.max_surge_percent) / 100) as u32
    }

    /// `ceil(desired × min_healthy / 100)`.
    pub fn min_healthy(&self, desired: u32) -> u32 {
        (u64::from(desired) * u64::from(self.min_healthy_percent)).div_ceil(100) as u32
    }

    /// The running cap actually enforced; never below desired.
    pub fn running_cap(&self, desired: u32) -> u32 {
        self.max_running(desired).max(desired)
    }

    /// Reject a policy under which a rollout can never start: no room to
    /// surge and no room to drain.
    pub fn validate(&self, desired: u32) -> RolloutResult<()> {
        if desired == 0 {
            return Ok(());
        }
        let reason = if self.max_running(desired) <= desired && self.min_healthy(desired) >= desired {
            "no surge capacity and no headroom below desired"
        } else if self.stall_timeout.is_zero() {
            "stall timeout must be positive"
        } else {
            return Ok(());
        };
        Err(RolloutError::InvalidPolicy {
            desired,
            max_surge_percent: self.max_surge_percent,
            min_healthy_percent: self.min_healthy_percent,
            reason: reason.to_string(),
        })
    }
}

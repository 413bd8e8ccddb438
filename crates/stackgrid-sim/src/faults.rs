//! Fault knobs for the simulated backend.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use stackgrid_core::ResourceKind;

/// How the simulated certificate authority answers polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthorityBehavior {
    /// Issue once the validation record has been visible for `after_polls` polls.
    Issue { after_polls: u32 },
    /// Stay pending forever.
    Never,
    /// Reject domain ownership on the first poll that sees the record.
    Reject { reason: String },
}

impl Default for AuthorityBehavior {
    fn default() -> Self {
        AuthorityBehavior::Issue { after_polls: 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faults {
    /// Creates of a kind that fail with `Transient` before one succeeds.
    pub transient_creates: BTreeMap<ResourceKind, u32>,
    /// Creates of a kind that succeed remotely but whose response is lost.
    pub lost_responses: BTreeMap<ResourceKind, u32>,
    /// Kinds whose create is always rejected.
    pub rejected_kinds: BTreeSet<ResourceKind>,
    /// Reads that report `Creating` after each create or update.
    pub readiness_reads: u32,
    /// DNS calls that fail with `Transient` before one succeeds.
    pub transient_dns: u32,
    /// Authority polls that fail with `Transient` before one succeeds.
    pub transient_polls: u32,
    pub authority: AuthorityBehavior,
    /// Images (matched by substring) whose replicas never pass health checks.
    pub unhealthy_images: BTreeSet<String>,
}

impl Faults {
    pub fn transient(mut self, kind: ResourceKind, count: u32) -> Self {
        self.transient_creates.insert(kind, count);
        self
    }

    pub fn lose_responses(mut self, kind: ResourceKind, count: u32) -> Self {
        self.lost_responses.insert(kind, count);
        self
    }

    pub fn reject(mut self, kind: ResourceKind) -> Self {
        self.rejected_kinds.insert(kind);
        self
    }

    pub fn authority(mut self, behavior: AuthorityBehavior) -> Self {
        self.authority = behavior;
        self
    }

    pub fn unhealthy_image(mut self, pattern: impl Into<String>) -> Self {
        self.unhealthy_images.insert(pattern.into());
        self
    }

    pub(crate) fn image_is_unhealthy(&self, image: &str) -> bool {
        self.unhealthy_images
            .iter()
            .any(|pattern| image.contains(pattern.as_str()))
    }

    /// Consume one fault from a per-kind budget.
    pub(crate) fn take(budget: &mut BTreeMap<ResourceKind, u32>, kind: ResourceKind) -> bool {
        match budget.get_mut(&kind) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

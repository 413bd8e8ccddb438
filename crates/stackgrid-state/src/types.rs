//! Record types for the StackGrid state store.
//!
//! An `EntityRecord` is the persisted form of one ready (or failed) graph
//! node: which runtime resource backs it, which generation it is, and the
//! serialized output downstream nodes consume.

use serde::{Deserialize, Serialize};
use stackgrid_core::{ResourceId, ResourceKind};

/// Persisted state of one provisioned entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub kind: ResourceKind,
    /// Logical node name within the stack (e.g. `boundary/edge`).
    pub name: String,
    /// Runtime id of the primary resource, if the node owns one.
    pub resource_id: Option<ResourceId>,
    /// Incremented every time the entity is replaced.
    pub generation: u64,
    /// Hex SHA-256 of the desired spec plus producer ids.
    pub fingerprint: String,
    pub status: EntityStatus,
    /// Table keys of the producer entities.
    pub depends_on: Vec<String>,
    /// Node output as consumed by dependents.
    pub output: serde_json::Value,
    /// Unix timestamp (seconds) when this generation was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntityStatus {
    /// Created and confirmed ready.
    Ready,
    /// Provisioning failed; `terminal` entities are not retried automatically.
    Failed { reason: String, terminal: bool },
    /// Replaced by a newer generation, still exists remotely.
    Superseded,
    /// Replaced and deleted remotely.
    Retired,
}

impl EntityRecord {
    /// Build the composite key for the entities table.
    pub fn table_key(&self) -> String {
        entity_key(self.kind, &self.name)
    }

    /// Build the composite key for the history table.
    pub fn history_key(&self) -> String {
        format!("{}:{:010}", self.table_key(), self.generation)
    }

    pub fn is_ready(&self) -> bool {
        self.status == EntityStatus::Ready
    }
}

/// Composite entity key `{kind}/{name}`.
pub fn entity_key(kind: ResourceKind, name: &str) -> String {
    format!("{}/{}", kind.as_str(), name)
}

// ── Apply runs ─────────────────────────────────────────────────────

/// Summary of one `apply` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyRun {
    pub id: String,
    pub stack: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub outcome: RunOutcome,
    pub created: Vec<String>,
    pub kept: Vec<String>,
    pub updated: Vec<String>,
    pub retired: Vec<String>,
    /// `node: reason` for every failed node.
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub ready_unused: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyApplied,
    Rejected,
}

impl ApplyRun {
    /// Build the composite key for the runs table.
    pub fn table_key(&self) -> String {
        format!("{:020}-{}", self.started_at, self.id)
    }
}

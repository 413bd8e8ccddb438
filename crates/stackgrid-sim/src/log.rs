//! Call and mutation logs of the simulated backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackgrid_core::{ResourceId, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    DnsPublish,
    DnsQuery,
    CertificateRequest,
    CertificatePoll,
    ImagePublish,
}

impl Operation {
    /// Whether the call can change cloud resources.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

/// One call made against the simulated backend, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub operation: Operation,
    pub target: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Created,
    Updated,
    Deleted,
}

/// A change to the resource set. Only successful mutations are logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub seq: u64,
    pub mutation: Mutation,
    pub kind: ResourceKind,
    pub id: ResourceId,
    pub name: String,
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub spec: serde_json::Value,
}

/// The resource set as it stood right after event `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub seq: u64,
    pub resources: BTreeMap<ResourceId, SnapshotEntry>,
}

impl TopologySnapshot {
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources.values().filter(|e| e.kind == kind).count()
    }

    /// Ports of every listener in the snapshot.
    pub fn listener_ports(&self) -> Vec<u16> {
        self.resources
            .values()
            .filter(|e| e.kind == ResourceKind::Listener)
            .filter_map(|e| e.spec.get("port").and_then(|p| p.as_u64()))
            .map(|p| p as u16)
            .collect()
    }
}

/// Replay `events` into one snapshot per event.
pub fn replay(events: &[CloudEvent]) -> Vec<TopologySnapshot> {
    let mut current: BTreeMap<ResourceId, SnapshotEntry> = BTreeMap::new();
    let mut snapshots = Vec::with_capacity(events.len());
    for event in events {
        match event.mutation {
            Mutation::Created | Mutation::Updated => {
                current.insert(
                    event.id.clone(),
                    SnapshotEntry {
                        kind: event.kind,
                        name: event.name.clone(),
                        spec: event.spec.clone(),
                    },
                );
            }
            Mutation::Deleted => {
                current.remove(&event.id);
            }
        }
        snapshots.push(TopologySnapshot {
            seq: event.seq,
            resources: current.clone(),
        });
    }
    snapshots
}

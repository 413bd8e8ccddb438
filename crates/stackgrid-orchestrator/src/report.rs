//! What a walk did to each node.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::graph::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "fate", rename_all = "snake_case")]
pub enum NodeFate {
    /// A new generation was created. `generation > 1` means the node was
    /// replaced.
    Created { generation: u64 },
    /// Changed in place; the generation is unchanged.
    Updated { generation: u64 },
    /// Stored record matched and the resource still exists.
    Kept { generation: u64 },
    Failed { reason: String },
    /// Not attempted because a producer did not reach Ready.
    Skipped { reason: String },
}

impl NodeFate {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            NodeFate::Created { .. } | NodeFate::Updated { .. } | NodeFate::Kept { .. }
        )
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            NodeFate::Created { generation }
            | NodeFate::Updated { generation }
            | NodeFate::Kept { generation } => Some(*generation),
            NodeFate::Failed { .. } | NodeFate::Skipped { .. } => None,
        }
    }
}

/// Result of a fully successful apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub stack: String,
    pub fates: BTreeMap<NodeId, NodeFate>,
    /// `kind/name:generation` of every generation retired after the walk.
    pub retired: Vec<String>,
    pub elapsed: Duration,
}

impl ApplyReport {
    pub fn fate(&self, node: NodeId) -> Option<&NodeFate> {
        self.fates.get(&node)
    }

    fn matching(&self, pick: impl Fn(&NodeFate) -> bool) -> Vec<NodeId> {
        self.fates
            .iter()
            .filter(|(_, fate)| pick(fate))
            .map(|(node, _)| *node)
            .collect()
    }

    pub fn created(&self) -> Vec<NodeId> {
        self.matching(|f| matches!(f, NodeFate::Created { .. }))
    }

    pub fn updated(&self) -> Vec<NodeId> {
        self.matching(|f| matches!(f, NodeFate::Updated { .. }))
    }

    pub fn kept(&self) -> Vec<NodeId> {
        self.matching(|f| matches!(f, NodeFate::Kept { .. }))
    }

    /// True when the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.retired.is_empty() && self.fates.values().all(|f| matches!(f, NodeFate::Kept { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_means_everything_kept() {
        let mut report = ApplyReport {
            run_id: "run-1".to_string(),
            stack: "demo".to_string(),
            fates: BTreeMap::new(),
            retired: Vec::new(),
            elapsed: Duration::ZERO,
        };
        report
            .fates
            .insert(NodeId::Network, NodeFate::Kept { generation: 1 });
        assert!(report.is_noop());

        report
            .fates
            .insert(NodeId::Image, NodeFate::Created { generation: 2 });
        assert!(!report.is_noop());
        assert_eq!(report.created(), vec![NodeId::Image]);
        assert_eq!(report.fate(NodeId::Image).unwrap().generation(), Some(2));
    }
}

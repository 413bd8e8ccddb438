//! Provisioning error taxonomy.

use stackgrid_cert::CertError;
use stackgrid_cloud::CloudError;
use stackgrid_core::config::ConfigError;
use stackgrid_edge::EdgeError;
use stackgrid_network::{NetworkError, TopologyError};
use stackgrid_rollout::RolloutError;
use stackgrid_state::StateError;
use thiserror::Error;

use crate::graph::NodeId;

/// One node that did not reach Ready.
#[derive(Debug)]
pub struct FailedNode {
    pub node: NodeId,
    pub error: Box<ProvisionError>,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid deployment policy: {0}")]
    InvalidPolicy(String),

    #[error("certificate {certificate} is not ready (state: {state})")]
    CertificateNotReady { certificate: String, state: String },

    #[error("DNS validation for {domain} not observed within {waited_ms}ms")]
    ValidationTimeout { domain: String, waited_ms: u64 },

    #[error("certificate authority rejected {domain}: {reason}")]
    CertificateRejected { domain: String, reason: String },

    #[error(
        "certificate for {domain} failed earlier ({reason}); \
         re-run with --reissue-certificate"
    )]
    CertificateTerminal { domain: String, reason: String },

    #[error("{node} cancelled")]
    Cancelled { node: String },

    #[error("ordering violation: {node} started before {missing} was ready")]
    OrderingViolation { node: String, missing: String },

    #[error(
        "apply partially failed: {} failed, {} skipped, {} ready but unused",
        failed.len(),
        skipped.len(),
        ready_unused.len()
    )]
    PartialApplyFailure {
        failed: Vec<FailedNode>,
        skipped: Vec<NodeId>,
        ready_unused: Vec<NodeId>,
    },

    #[error("rollout of {service} to {revision} stalled: {reason}")]
    RolloutStalled {
        service: String,
        revision: String,
        reason: String,
        rolled_back: bool,
    },

    #[error("image: {0}")]
    Image(String),

    #[error("resource {id} is missing attribute {attribute}")]
    MissingAttribute { id: String, attribute: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProvisionError {
    /// The failed nodes when this is a partial failure.
    pub fn failed_nodes(&self) -> &[FailedNode] {
        match self {
            ProvisionError::PartialApplyFailure { failed, .. } => failed,
            _ => &[],
        }
    }

    /// The error a given node failed with, if it did.
    pub fn failure_of(&self, node: NodeId) -> Option<&ProvisionError> {
        self.failed_nodes()
            .iter()
            .find(|f| f.node == node)
            .map(|f| f.error.as_ref())
    }
}

impl From<TopologyError> for ProvisionError {
    fn from(e: TopologyError) -> Self {
        ProvisionError::InvalidTopology(e.to_string())
    }
}

impl From<NetworkError> for ProvisionError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Topology(t) => t.into(),
            NetworkError::Cloud(c) => ProvisionError::Cloud(c),
        }
    }
}

impl From<CertError> for ProvisionError {
    fn from(e: CertError) -> Self {
        match e {
            CertError::NotReady { domain, state } => ProvisionError::CertificateNotReady {
                certificate: domain,
                state,
            },
            CertError::ValidationTimeout { domain, waited } => ProvisionError::ValidationTimeout {
                domain,
                waited_ms: waited.as_millis() as u64,
            },
            CertError::Rejected { domain, reason } => {
                ProvisionError::CertificateRejected { domain, reason }
            }
            CertError::Cancelled { domain } => ProvisionError::Cancelled {
                node: format!("certificate validation for {domain}"),
            },
            CertError::Cloud(c) => ProvisionError::Cloud(c),
            other @ (CertError::IllegalTransition { .. } | CertError::RecordMissing { .. }) => {
                ProvisionError::InvalidTopology(other.to_string())
            }
        }
    }
}

impl From<EdgeError> for ProvisionError {
    fn from(e: EdgeError) -> Self {
        match e {
            EdgeError::Certificate(c) => c.into(),
            EdgeError::Cloud(c) => ProvisionError::Cloud(c),
            EdgeError::MissingHttpsListener { router } => ProvisionError::OrderingViolation {
                node: format!("HTTP redirect listener on {router}"),
                missing: "HTTPS listener".to_string(),
            },
            EdgeError::MissingAttribute { id, attribute } => {
                ProvisionError::MissingAttribute { id, attribute }
            }
            other @ (EdgeError::WrongBoundary(_)
            | EdgeError::NoPublicSubnets(_)
            | EdgeError::ForeignPool { .. }) => ProvisionError::InvalidTopology(other.to_string()),
        }
    }
}

impl From<RolloutError> for ProvisionError {
    fn from(e: RolloutError) -> Self {
        match e {
            RolloutError::InvalidPolicy { .. } => ProvisionError::InvalidPolicy(e.to_string()),
            RolloutError::Stalled {
                service,
                revision,
                reason,
                rolled_back,
            } => ProvisionError::RolloutStalled {
                service,
                revision,
                reason,
                rolled_back,
            },
            RolloutError::MissingAttribute { id, attribute } => {
                ProvisionError::MissingAttribute { id, attribute }
            }
            RolloutError::Cloud(c) => ProvisionError::Cloud(c),
            other @ (RolloutError::MutableImage(_)
            | RolloutError::PublicPlacement(_)
            | RolloutError::WrongBoundary(_)) => ProvisionError::InvalidTopology(other.to_string()),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn certificate_errors_keep_their_class() {
        let err: ProvisionError = CertError::ValidationTimeout {
            domain: "app.example.com".to_string(),
            waited: Duration::from_secs(90),
        }
        .into();
        assert!(matches!(
            err,
            ProvisionError::ValidationTimeout { waited_ms: 90_000, .. }
        ));

        let err: ProvisionError = EdgeError::Certificate(CertError::NotReady {
            domain: "app.example.com".to_string(),
            state: "pending_validation".to_string(),
        })
        .into();
        assert!(matches!(err, ProvisionError::CertificateNotReady { .. }));
    }

    #[test]
    fn missing_https_listener_is_an_ordering_violation() {
        let err: ProvisionError = EdgeError::MissingHttpsListener {
            router: "lb-0001".to_string(),
        }
        .into();
        assert!(matches!(err, ProvisionError::OrderingViolation { .. }));
    }

    #[test]
    fn stalled_rollout_maps_to_rollout_stalled() {
        let err: ProvisionError = RolloutError::Stalled {
            service: "web".to_string(),
            revision: "web:2".to_string(),
            reason: "0/1 healthy".to_string(),
            rolled_back: false,
        }
        .into();
        assert!(matches!(
            err,
            ProvisionError::RolloutStalled { rolled_back: false, .. }
        ));
    }
}

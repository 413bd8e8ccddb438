//! Workload and rollout errors.

use stackgrid_cloud::CloudError;
use stackgrid_network::BoundaryRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(
        "deployment policy cannot progress for {desired} replicas \
         (max surge {max_surge_percent}%, min healthy {min_healthy_percent}%): {reason}"
    )]
    InvalidPolicy {
        desired: u32,
        max_surge_percent: u32,
        min_healthy_percent: u32,
        reason: String,
    },

    #[error("image {0} is not pinned by digest")]
    MutableImage(String),

    #[error("subnet {0} is public; workloads run in private subnets only")]
    PublicPlacement(String),

    #[error("workloads must sit behind the workload boundary, got {0}")]
    WrongBoundary(BoundaryRole),

    #[error("rollout of {service} to {revision} stalled: {reason}")]
    Stalled {
        service: String,
        revision: String,
        reason: String,
        rolled_back: bool,
    },

    #[error("resource {id} is missing attribute {attribute}")]
    MissingAttribute { id: String, attribute: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;

//! Edge builder errors.

use stackgrid_cert::CertError;
use stackgrid_cloud::CloudError;
use stackgrid_network::BoundaryRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error("router {router} has no HTTPS listener on 443; refusing to open plaintext HTTP")]
    MissingHttpsListener { router: String },

    #[error("edge router must sit behind the edge boundary, got {0}")]
    WrongBoundary(BoundaryRole),

    #[error("network {0} has no public subnets for the edge router")]
    NoPublicSubnets(String),

    #[error("target pool {pool} belongs to router {expected}, not {actual}")]
    ForeignPool {
        pool: String,
        expected: String,
        actual: String,
    },

    #[error("resource {id} is missing attribute {attribute}")]
    MissingAttribute { id: String, attribute: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl EdgeError {
    /// True when the failure is an unvalidated certificate.
    pub fn is_certificate_not_ready(&self) -> bool {
        matches!(self, EdgeError::Certificate(CertError::NotReady { .. }))
    }
}

pub type EdgeResult<T> = Result<T, EdgeError>;

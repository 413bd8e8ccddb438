//! Certificate workflow errors.

use std::time::Duration;

use stackgrid_cloud::CloudError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CertError {
    #[error("certificate for {domain} is not ready (state: {state})")]
    NotReady { domain: String, state: String },

    #[error("illegal certificate transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("validation for {domain} not observed within {waited:?}")]
    ValidationTimeout { domain: String, waited: Duration },

    #[error("certificate authority rejected {domain}: {reason}")]
    Rejected { domain: String, reason: String },

    #[error("validation wait for {domain} cancelled")]
    Cancelled { domain: String },

    #[error("validation record {name} not found in zone {zone_id}")]
    RecordMissing { name: String, zone_id: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

pub type CertResult<T> = Result<T, CertError>;

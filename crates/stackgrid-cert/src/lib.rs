//! stackgrid-cert — TLS certificate issuance with DNS validation.
//!
//! A certificate moves through `Requested → PendingValidation →
//! {Validated, Failed}`. Validated is a blocking gate: listener binds call
//! [`Certificate::require_validated`] before touching the cloud. Failed is
//! terminal; the workflow never silently re-requests.

pub mod certificate;
pub mod error;
pub mod workflow;

pub use certificate::{Certificate, CertificateState, FailureReason};
pub use error::{CertError, CertResult};
pub use workflow::CertificateWorkflow;

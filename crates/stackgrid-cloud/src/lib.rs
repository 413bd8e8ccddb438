//! stackgrid-cloud — the capability interfaces the orchestrator calls.
//!
//! Nothing in this crate talks to a real provider. It defines the four
//! collaborator traits, the error taxonomy they share, and the
//! single-resource retry and readiness helpers every builder goes
//! through.
//!
//! # Components
//!
//! - **`api`** — `CloudResourceApi`, `DnsZoneApi`, `CertificateAuthorityApi`,
//!   `ImageRegistry` and their request/response types
//! - **`retry`** — bounded exponential backoff for retryable errors
//! - **`provisioner`** — create/update/delete that only return once the
//!   resource is `Available`, with idempotent client tokens

pub mod api;
pub mod error;
pub mod provisioner;
pub mod retry;

pub use api::*;
pub use error::{CloudError, CloudResult};
pub use provisioner::{Provisioner, Scope};
pub use retry::{Backoff, RetryPolicy};

//! stackgrid-sim — an in-memory backend for every capability trait.
//!
//! `stackctl apply` and the integration tests run the orchestrator against
//! [`SimulatedCloud`]. It behaves like a well-mannered provider (idempotent
//! creates, readiness, sequential revisions, a certificate authority that
//! checks DNS) until a [`Faults`] knob says otherwise.
//!
//! # Components
//!
//! - **`backend`** — `SimulatedCloud`: resources, zones, certificates, registry
//! - **`faults`** — transient errors, lost responses, stubborn authorities,
//!   unhealthy images
//! - **`fleet`** — managed service deployments run on the rollout simulator
//! - **`log`** — call log, mutation events and topology snapshots

pub mod backend;
pub mod faults;
mod fleet;
pub mod log;

pub use backend::{SIM_REGISTRY, SimulatedCloud};
pub use faults::{AuthorityBehavior, Faults};
pub use log::{ApiCall, CloudEvent, Mutation, Operation, SnapshotEntry, TopologySnapshot, replay};

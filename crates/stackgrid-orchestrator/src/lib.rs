//! stackgrid-orchestrator — dependency-ordered provisioning of one stack.
//!
//! A [`Plan`] validates a resolved stack and derives the desired state of
//! every node in the fixed topology graph. The [`Orchestrator`] walks that
//! graph against the capability interfaces, gating each node on its
//! producers' readiness and persisting every Ready node in the state
//! store so a re-run only touches what changed.
//!
//! # Components
//!
//! - **`graph`** — `NodeId` and the validated `TopologyGraph`
//! - **`plan`** — plan-time validation and per-node desired specs
//! - **`outputs`** — typed node outputs and the producer view a node gets
//! - **`engine`** — the concurrent walk, keep/update/replace and retirement
//! - **`report`** — per-node fates of a successful walk
//! - **`error`** — the `ProvisionError` taxonomy

pub mod engine;
pub mod error;
mod executor;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod providers;
pub mod report;

pub use engine::{ApplyOptions, Orchestrator};
pub use error::{FailedNode, ProvisionError, ProvisionResult};
pub use graph::{NodeId, TopologyGraph};
pub use outputs::{Inputs, NodeOutput};
pub use plan::{ImagePlan, Names, Plan};
pub use providers::Providers;
pub use report::{ApplyReport, NodeFate};

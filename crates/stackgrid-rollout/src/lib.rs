//! stackgrid-rollout — workload definitions, managed services and
//! bounded-surge rolling updates.
//!
//! This crate provides the rollout state machine that managed services
//! follow when they move to a new workload definition revision, plus a
//! fleet simulator that runs it against target pool health checks.
//!
//! # Components
//!
//! - **`policy`** — Deployment policy (max surge %, min healthy %, stall handling)
//! - **`controller`** — Rolling update state machine (launch, drain, stall, rollback)
//! - **`sim`** — Fleet simulator driving the controller on a logical clock
//! - **`workload`** — Workload definition, log sink, execution role, cluster
//! - **`service`** — Managed service placement and deployment tracking

pub mod controller;
pub mod error;
pub mod policy;
pub mod service;
pub mod sim;
pub mod workload;

pub use controller::{FleetView, RollingUpdate, RolloutAction, RolloutPhase};
pub use error::{RolloutError, RolloutResult};
pub use policy::DeploymentPolicy;
pub use service::{
    DeploymentState, DeploymentStatus, ManagedService, ManagedServiceSpec, Placement,
    create_service, update_service,
};
pub use sim::{FleetConfig, FleetSample, FleetSimulator, RolloutReport};
pub use workload::{
    Cluster, ExecutionRole, LogSink, ResourceShape, WorkloadDefinition, WorkloadDefinitionSpec,
    create_cluster, create_execution_role, create_log_sink, register_definition,
};

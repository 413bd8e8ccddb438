//! stackgrid-health — target pool health checking.
//!
//! A replica only counts as healthy once the target pool has seen
//! `healthy_threshold` consecutive passing probes, and it drops out after
//! `unhealthy_threshold` consecutive failures. The tracker is pure state
//! so the rollout simulator and the live HTTP probe share it.
//!
//! # Architecture
//!
//! ```text
//! ProbePolicy (path, interval, timeout, thresholds)
//!   ├── HealthTracker (consecutive counts, backoff)
//!   └── http_probe() → ProbeResult
//! ```
//!
//! Exponential backoff (interval → 60s) prevents hammering unhealthy
//! targets. A single successful probe resets the backoff.

pub mod checker;

pub use checker::{HealthStatus, HealthTracker, ProbePolicy, ProbeResult, http_probe};

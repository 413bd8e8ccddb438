//! stackgrid-edge — the load-balancing front door.
//!
//! The edge router lives on public subnets behind the edge boundary and
//! carries exactly two listeners:
//!
//! - 443/HTTPS forwarding to the target pool, bound to a validated
//!   certificate;
//! - 80/HTTP answering every request with a 301 to HTTPS, created only
//!   once the HTTPS listener exists.
//!
//! Both preconditions are checked before any cloud call is made.

pub mod builder;
pub mod error;
pub mod pool;
pub mod router;

pub use builder::{
    bind_http_redirect, bind_https, create_router, create_target_pool, publish_alias,
    rebind_https,
};
pub use error::{EdgeError, EdgeResult};
pub use pool::{PoolMembership, TargetPool, TargetPoolSpec, TargetState};
pub use router::{AliasRecord, EdgeRouter, Listener, ListenerAction, ListenerProtocol};

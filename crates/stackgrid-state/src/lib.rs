//! stackgrid-state — entity snapshot store for StackGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the current generation
//! of every provisioned entity, the superseded generations awaiting or
//! past retirement, and a log of apply runs.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Entities are keyed `{kind}/{name}`; history entries append the
//! zero-padded generation (`{kind}/{name}:{generation}`) so a prefix scan
//! returns revisions in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

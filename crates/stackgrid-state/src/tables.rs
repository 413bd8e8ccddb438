//! redb table definitions for the StackGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Current generation of each entity, keyed by `{kind}/{name}`.
pub const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");

/// Superseded generations, keyed by `{kind}/{name}:{generation:010}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Apply run reports, keyed by `{started_at:020}-{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

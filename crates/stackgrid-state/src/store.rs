//! StateStore — redb-backed snapshot persistence for StackGrid.
//!
//! Provides typed operations over entity records, their superseded
//! generations, and apply runs. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Entities ───────────────────────────────────────────────────

    /// Insert or overwrite the current generation of an entity.
    ///
    /// When the stored record has a different generation and still owns
    /// something remotely (it was ready, or a failed attempt left a
    /// resource behind) it is moved to the history table as `Superseded`
    /// in the same transaction, and returned so the caller can schedule
    /// its retirement.
    pub fn put_entity(&self, record: &EntityRecord) -> StateResult<Option<EntityRecord>> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let superseded = {
            let mut table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
            let previous = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());

            let superseded = match previous {
                Some(bytes) => {
                    let mut old: EntityRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    let owns_resources = old.is_ready() || old.resource_id.is_some();
                    if old.generation != record.generation && owns_resources {
                        old.status = EntityStatus::Superseded;
                        old.updated_at = record.updated_at;
                        Some(old)
                    } else {
                        None
                    }
                }
                None => None,
            };

            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            superseded
        };

        if let Some(old) = &superseded {
            let history_value = serde_json::to_vec(old).map_err(map_err!(Serialize))?;
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            history
                .insert(old.history_key().as_str(), history_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %key,
            generation = record.generation,
            superseded = superseded.is_some(),
            "entity stored"
        );
        Ok(superseded)
    }

    /// Get an entity by `{kind}/{name}` key.
    pub fn get_entity(&self, key: &str) -> StateResult<Option<EntityRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: EntityRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List the current generation of every entity.
    pub fn list_entities(&self) -> StateResult<Vec<EntityRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: EntityRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete an entity by key. Returns true if it existed.
    pub fn delete_entity(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENTITIES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "entity deleted");
        Ok(existed)
    }

    // ── History ────────────────────────────────────────────────────

    /// All superseded generations of one entity, oldest first.
    pub fn list_history(&self, key: &str) -> StateResult<Vec<EntityRecord>> {
        let prefix = format!("{key}:");
        self.scan_history(|k, _| k.starts_with(&prefix))
    }

    /// Highest generation ever written to history for `key`.
    pub fn latest_history_generation(&self, key: &str) -> StateResult<Option<u64>> {
        Ok(self
            .list_history(key)?
            .iter()
            .map(|record| record.generation)
            .max())
    }

    /// File a generation that never became current straight into history
    /// as `Superseded`, so what it left behind is retired with the rest.
    pub fn put_remnant(&self, record: &EntityRecord) -> StateResult<()> {
        let key = record.history_key();
        let mut parked = record.clone();
        parked.status = EntityStatus::Superseded;
        let value = serde_json::to_vec(&parked).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "remnant generation parked for retirement");
        Ok(())
    }

    /// Superseded generations that still exist remotely.
    pub fn pending_retirements(&self) -> StateResult<Vec<EntityRecord>> {
        self.scan_history(|_, record| record.status == EntityStatus::Superseded)
    }

    /// Mark a superseded generation as retired (deleted remotely).
    pub fn mark_retired(&self, record: &EntityRecord, at: u64) -> StateResult<()> {
        let key = record.history_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            let existing = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::UnknownGeneration(key.clone()))?;

            let mut stored: EntityRecord =
                serde_json::from_slice(&existing).map_err(map_err!(Deserialize))?;
            stored.status = EntityStatus::Retired;
            stored.updated_at = at;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "generation retired");
        Ok(())
    }

    fn scan_history(
        &self,
        keep: impl Fn(&str, &EntityRecord) -> bool,
    ) -> StateResult<Vec<EntityRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let record: EntityRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(key.value(), &record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Append an apply run report.
    pub fn put_run(&self, run: &ApplyRun) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, outcome = ?run.outcome, "apply run stored");
        Ok(())
    }

    /// List apply runs, oldest first.
    pub fn list_runs(&self) -> StateResult<Vec<ApplyRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: ApplyRun =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgrid_core::{ResourceId, ResourceKind};

    fn test_record(name: &str, generation: u64) -> EntityRecord {
        EntityRecord {
            kind: ResourceKind::WorkloadDefinition,
            name: name.to_string(),
            resource_id: Some(ResourceId::new(format!("wd-{generation:04}"))),
            generation,
            fingerprint: format!("fp-{generation}"),
            status: EntityStatus::Ready,
            depends_on: vec!["image/app".to_string()],
            output: serde_json::json!({ "revision": generation }),
            created_at: 1000 + generation,
            updated_at: 1000 + generation,
        }
    }

    fn test_run(id: &str, started_at: u64) -> ApplyRun {
        ApplyRun {
            id: id.to_string(),
            stack: "demo".to_string(),
            started_at,
            finished_at: started_at + 5,
            outcome: RunOutcome::Succeeded,
            created: vec!["network/fabric".to_string()],
            kept: vec![],
            updated: vec![],
            retired: vec![],
            failed: vec![],
            skipped: vec![],
            ready_unused: vec![],
        }
    }

    // ── Entities ───────────────────────────────────────────────────

    #[test]
    fn entity_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_record("app", 1);

        assert!(store.put_entity(&record).unwrap().is_none());
        let retrieved = store.get_entity("workload_definition/app").unwrap();
        assert_eq!(retrieved, Some(record));
    }

    #[test]
    fn entity_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_entity("network/nothing").unwrap().is_none());
    }

    #[test]
    fn same_generation_overwrites_without_history() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_record("app", 1);
        store.put_entity(&record).unwrap();

        record.updated_at = 5000;
        assert!(store.put_entity(&record).unwrap().is_none());
        assert!(store.list_history("workload_definition/app").unwrap().is_empty());
        assert_eq!(
            store.get_entity("workload_definition/app").unwrap().unwrap().updated_at,
            5000
        );
    }

    #[test]
    fn new_generation_supersedes_previous() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_entity(&test_record("app", 1)).unwrap();

        let superseded = store.put_entity(&test_record("app", 2)).unwrap().unwrap();
        assert_eq!(superseded.generation, 1);
        assert_eq!(superseded.status, EntityStatus::Superseded);

        let current = store.get_entity("workload_definition/app").unwrap().unwrap();
        assert_eq!(current.generation, 2);

        let history = store.list_history("workload_definition/app").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(store.pending_retirements().unwrap().len(), 1);
    }

    fn failed_record(name: &str, generation: u64) -> EntityRecord {
        EntityRecord {
            status: EntityStatus::Failed {
                reason: "boom".to_string(),
                terminal: false,
            },
            resource_id: None,
            output: serde_json::Value::Null,
            ..test_record(name, generation)
        }
    }

    #[test]
    fn failed_record_without_resources_is_not_kept_in_history() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_entity(&failed_record("app", 1)).unwrap();

        assert!(store.put_entity(&test_record("app", 2)).unwrap().is_none());
        assert!(store.pending_retirements().unwrap().is_empty());
    }

    #[test]
    fn failed_record_holding_a_resource_is_superseded() {
        let store = StateStore::open_in_memory().unwrap();
        let mut failed = failed_record("app", 1);
        failed.resource_id = Some(ResourceId::new("svc-0001"));
        store.put_entity(&failed).unwrap();

        let superseded = store.put_entity(&test_record("app", 2)).unwrap().unwrap();
        assert_eq!(superseded.resource_id, Some(ResourceId::new("svc-0001")));
        let pending = store.pending_retirements().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].generation, 1);
    }

    #[test]
    fn retried_failure_keeps_its_generation_out_of_history() {
        let store = StateStore::open_in_memory().unwrap();
        let mut failed = failed_record("app", 1);
        failed.resource_id = Some(ResourceId::new("svc-0001"));
        store.put_entity(&failed).unwrap();

        assert!(store.put_entity(&test_record("app", 1)).unwrap().is_none());
        assert!(store.pending_retirements().unwrap().is_empty());
    }

    #[test]
    fn remnants_wait_for_retirement_beside_the_current_generation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_entity(&test_record("app", 1)).unwrap();
        let mut remnant = failed_record("app", 2);
        remnant.resource_id = Some(ResourceId::new("svc-0002"));
        store.put_remnant(&remnant).unwrap();

        let current = store.get_entity("workload_definition/app").unwrap().unwrap();
        assert_eq!(current.generation, 1);
        assert!(current.is_ready());
        let pending = store.pending_retirements().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, EntityStatus::Superseded);
        assert_eq!(
            store.latest_history_generation("workload_definition/app").unwrap(),
            Some(2)
        );
    }

    #[test]
    fn mark_retired_clears_pending() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_entity(&test_record("app", 1)).unwrap();
        let old = store.put_entity(&test_record("app", 2)).unwrap().unwrap();

        store.mark_retired(&old, 9000).unwrap();
        assert!(store.pending_retirements().unwrap().is_empty());
        let history = store.list_history("workload_definition/app").unwrap();
        assert_eq!(history[0].status, EntityStatus::Retired);
        assert_eq!(history[0].updated_at, 9000);
    }

    #[test]
    fn mark_retired_unknown_generation_errors() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_record("ghost", 3);
        assert!(matches!(
            store.mark_retired(&record, 1),
            Err(StateError::UnknownGeneration(_))
        ));
    }

    #[test]
    fn entity_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_entity(&test_record("app", 1)).unwrap();

        assert!(store.delete_entity("workload_definition/app").unwrap());
        assert!(!store.delete_entity("workload_definition/app").unwrap());
        assert!(store.list_entities().unwrap().is_empty());
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn runs_list_in_start_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_run(&test_run("b", 2000)).unwrap();
        store.put_run(&test_run("a", 1000)).unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "a");
        assert_eq!(runs[1].id, "b");
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_entity(&test_record("app", 1)).unwrap();
            store.put_entity(&test_record("app", 2)).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let current = store.get_entity("workload_definition/app").unwrap().unwrap();
        assert_eq!(current.generation, 2);
        assert_eq!(store.pending_retirements().unwrap().len(), 1);
    }
}
